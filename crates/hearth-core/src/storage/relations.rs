//! Relation graph and contradiction links

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use rusqlite::params;

use super::sqlite::{parse_ts, ts, Result, Storage};
use crate::memory::{MemoryEntry, MemoryRelation, RelationDirection, RelationType};

fn row_to_relation(row: &rusqlite::Row) -> rusqlite::Result<MemoryRelation> {
    let relation_type: String = row.get("relation_type")?;
    let created_at: String = row.get("created_at")?;
    Ok(MemoryRelation {
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        relation_type: relation_type.parse().unwrap_or(RelationType::Extends),
        confidence: row.get("confidence")?,
        created_at: parse_ts(&created_at, "created_at")?,
    })
}

impl Storage {
    /// Record a typed edge. Returns false if the edge already existed.
    ///
    /// An UPDATES edge marks the target superseded in the same transaction.
    /// Nothing is ever deleted through the graph.
    pub fn add_relation(
        &self,
        source_id: &str,
        target_id: &str,
        relation_type: RelationType,
        confidence: f64,
    ) -> Result<bool> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO memory_relations
                (source_id, target_id, relation_type, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                source_id,
                target_id,
                relation_type.as_str(),
                confidence.clamp(0.0, 1.0),
                ts(Utc::now())
            ],
        )?;

        if relation_type == RelationType::Updates {
            tx.execute(
                "UPDATE memories SET is_latest = 0, memory_type = 'superseded' WHERE id = ?1",
                params![target_id],
            )?;
        }

        tx.commit()?;
        tracing::debug!(source_id, target_id, relation = %relation_type, "Relation recorded");
        Ok(inserted > 0)
    }

    /// Edges touching a memory, optionally filtered by type
    pub fn relations_for(
        &self,
        memory_id: &str,
        direction: RelationDirection,
        relation_type: Option<RelationType>,
    ) -> Result<Vec<MemoryRelation>> {
        let clause = match direction {
            RelationDirection::Incoming => "target_id = ?1",
            RelationDirection::Outgoing => "source_id = ?1",
            RelationDirection::Both => "(source_id = ?1 OR target_id = ?1)",
        };
        let sql = format!(
            "SELECT * FROM memory_relations
             WHERE {} AND (?2 IS NULL OR relation_type = ?2)
             ORDER BY created_at",
            clause
        );

        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(
            params![memory_id, relation_type.map(|t| t.as_str())],
            row_to_relation,
        )?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Whether `memory_id` has been replaced by an UPDATES edge
    pub fn is_updated_by_any(&self, memory_id: &str) -> Result<bool> {
        Ok(!self
            .relations_for(memory_id, RelationDirection::Incoming, Some(RelationType::Updates))?
            .is_empty())
    }

    /// Link two conflicting memories. Symmetric and idempotent.
    pub fn add_contradiction(&self, a: &str, b: &str) -> Result<()> {
        if a == b {
            return Ok(());
        }

        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        for (id, other) in [(a, b), (b, a)] {
            let current: String = tx.query_row(
                "SELECT contradiction_ids FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            let mut ids: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
            if !ids.iter().any(|x| x == other) {
                ids.push(other.to_string());
                tx.execute(
                    "UPDATE memories SET contradiction_ids = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&ids)?, id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Memories pairs that contradict each other and are both still latest
    pub fn unresolved_contradictions(&self, user_id: &str) -> Result<Vec<(MemoryEntry, MemoryEntry)>> {
        let latest: Vec<MemoryEntry> = {
            let reader = self.reader()?;
            let mut stmt = reader.prepare(
                "SELECT * FROM memories
                 WHERE user_id = ?1 AND is_latest = 1 AND contradiction_ids != '[]'",
            )?;
            let rows = stmt.query_map(params![user_id], Self::row_to_memory)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            entries
        };

        let by_id: BTreeMap<&str, &MemoryEntry> =
            latest.iter().map(|e| (e.id.as_str(), e)).collect();
        let mut pairs = Vec::new();
        for entry in &latest {
            for other_id in &entry.contradiction_ids {
                // Each pair once
                if entry.id.as_str() < other_id.as_str() {
                    if let Some(other) = by_id.get(other_id.as_str()) {
                        pairs.push((entry.clone(), (*other).clone()));
                    }
                }
            }
        }
        Ok(pairs)
    }

    /// Connected groups of latest memories linked by UPDATES/EXTENDS edges,
    /// largest first. Memories that already feed a derived summary are left
    /// out, so a cluster is fused at most once.
    pub fn relation_clusters(&self, user_id: &str, min_size: usize) -> Result<Vec<Vec<MemoryEntry>>> {
        let (members, edges): (BTreeMap<String, MemoryEntry>, Vec<(String, String)>) = {
            let reader = self.reader()?;

            let mut stmt = reader.prepare(
                "SELECT * FROM memories m
                 WHERE m.user_id = ?1 AND m.is_latest = 1 AND m.memory_type != 'derived'
                   AND NOT EXISTS (
                       SELECT 1 FROM memory_relations d
                       WHERE d.target_id = m.id AND d.relation_type = 'DERIVES'
                   )",
            )?;
            let rows = stmt.query_map(params![user_id], Self::row_to_memory)?;
            let mut members = BTreeMap::new();
            for row in rows {
                let entry = row?;
                members.insert(entry.id.clone(), entry);
            }

            let mut stmt = reader.prepare(
                "SELECT r.source_id, r.target_id FROM memory_relations r
                 JOIN memories m ON m.id = r.source_id
                 WHERE m.user_id = ?1 AND r.relation_type IN ('UPDATES', 'EXTENDS')",
            )?;
            let rows = stmt.query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut edges = Vec::new();
            for row in rows {
                edges.push(row?);
            }
            (members, edges)
        };

        // Union-find over member ids
        let ids: Vec<&String> = members.keys().collect();
        let index: BTreeMap<&str, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let mut parent: Vec<usize> = (0..ids.len()).collect();

        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        for (source, target) in &edges {
            if let (Some(&a), Some(&b)) = (index.get(source.as_str()), index.get(target.as_str())) {
                let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
                if ra != rb {
                    parent[ra] = rb;
                }
            }
        }

        let mut groups: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for i in 0..ids.len() {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().insert(i);
        }

        let mut clusters: Vec<Vec<MemoryEntry>> = groups
            .into_values()
            .filter(|g| g.len() >= min_size.max(2))
            .map(|g| g.into_iter().map(|i| members[ids[i]].clone()).collect())
            .collect();
        clusters.sort_by(|a, b| b.len().cmp(&a.len()));
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryType, NewMemory};
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(Some(dir.path().join("test.db"))).unwrap();
        (storage, dir)
    }

    #[test]
    fn test_updates_supersedes_without_deleting() {
        let (storage, _dir) = create_test_storage();
        let old = storage.insert_memory(NewMemory::new("u", "Works at Acme")).unwrap();
        let new = storage.insert_memory(NewMemory::new("u", "Works at Globex")).unwrap();

        assert!(storage
            .add_relation(&new.id, &old.id, RelationType::Updates, 0.9)
            .unwrap());
        // Idempotent
        assert!(!storage
            .add_relation(&new.id, &old.id, RelationType::Updates, 0.9)
            .unwrap());

        let old_after = storage.get_memory(&old.id).unwrap().unwrap();
        assert!(!old_after.is_latest);
        assert_eq!(old_after.memory_type, MemoryType::Superseded);
        assert!(storage.is_updated_by_any(&old.id).unwrap());

        let outgoing = storage
            .relations_for(&new.id, RelationDirection::Outgoing, None)
            .unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].target_id, old.id);
        assert!(storage
            .relations_for(&new.id, RelationDirection::Incoming, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_extends_keeps_both_latest() {
        let (storage, _dir) = create_test_storage();
        let a = storage.insert_memory(NewMemory::new("u", "Has a dog")).unwrap();
        let b = storage.insert_memory(NewMemory::new("u", "The dog is named Rex")).unwrap();
        storage.add_relation(&b.id, &a.id, RelationType::Extends, 0.8).unwrap();

        assert!(storage.get_memory(&a.id).unwrap().unwrap().is_latest);
        let both = storage
            .relations_for(&a.id, RelationDirection::Both, Some(RelationType::Extends))
            .unwrap();
        assert_eq!(both.len(), 1);
    }

    #[test]
    fn test_contradiction_symmetric_and_idempotent() {
        let (storage, _dir) = create_test_storage();
        let a = storage.insert_memory(NewMemory::new("u", "Vegetarian")).unwrap();
        let b = storage.insert_memory(NewMemory::new("u", "Loves steak")).unwrap();

        storage.add_contradiction(&a.id, &b.id).unwrap();
        storage.add_contradiction(&b.id, &a.id).unwrap();
        storage.add_contradiction(&a.id, &a.id).unwrap();

        let a_after = storage.get_memory(&a.id).unwrap().unwrap();
        let b_after = storage.get_memory(&b.id).unwrap().unwrap();
        assert_eq!(a_after.contradiction_ids, vec![b.id.clone()]);
        assert_eq!(b_after.contradiction_ids, vec![a.id.clone()]);

        assert_eq!(storage.unresolved_contradictions("u").unwrap().len(), 1);
        storage.supersede_memory(&a.id).unwrap();
        assert!(storage.unresolved_contradictions("u").unwrap().is_empty());
    }

    #[test]
    fn test_relation_clusters() {
        let (storage, _dir) = create_test_storage();
        let m: Vec<_> = (0..5)
            .map(|i| {
                storage
                    .insert_memory(NewMemory::new("u", format!("Garden fact {}", i)))
                    .unwrap()
            })
            .collect();
        storage.add_relation(&m[1].id, &m[0].id, RelationType::Extends, 0.8).unwrap();
        storage.add_relation(&m[2].id, &m[1].id, RelationType::Extends, 0.8).unwrap();
        storage.add_relation(&m[4].id, &m[3].id, RelationType::Extends, 0.8).unwrap();

        let clusters = storage.relation_clusters("u", 3).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);

        // Once fused, members drop out
        let summary = storage
            .insert_memory(NewMemory::new("u", "Garden summary").with_type(MemoryType::Derived))
            .unwrap();
        for member in &clusters[0] {
            storage
                .add_relation(&summary.id, &member.id, RelationType::Derives, 1.0)
                .unwrap();
        }
        assert!(storage.relation_clusters("u", 3).unwrap().is_empty());
    }
}
