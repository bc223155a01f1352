//! Hearth Similarity Benchmarks
//!
//! Run with: cargo bench -p hearth-core

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hearth_core::embeddings::cosine_similarity;
use hearth_core::text::{normalize_words, sanitize_fts5_query, word_overlap};

fn bench_cosine_similarity(c: &mut Criterion) {
    let a: Vec<f32> = (0..256).map(|i| (i as f32).sin()).collect();
    let b: Vec<f32> = (0..256).map(|i| (i as f32).cos()).collect();

    c.bench_function("cosine_similarity_256d", |bench| {
        bench.iter(|| black_box(cosine_similarity(black_box(&a), black_box(&b))))
    });

    // Brute-force scan as done by similar_memories
    let corpus: Vec<Vec<f32>> = (0..1000)
        .map(|n| (0..256).map(|i| ((n * 256 + i) as f32).sin()).collect())
        .collect();
    c.bench_function("cosine_scan_1000x256d", |bench| {
        bench.iter(|| {
            let best = corpus
                .iter()
                .map(|v| cosine_similarity(&a, v))
                .fold(f32::MIN, f32::max);
            black_box(best)
        })
    });
}

fn bench_word_overlap(c: &mut Criterion) {
    let pending = [
        "Remind me to call the dentist on Thursday morning",
        "Check whether the passport renewal went through",
        "Ask how the half marathon training is going",
        "Follow up on the apartment viewing next week",
    ];
    let candidate = "Call the dentist Thursday morning";

    c.bench_function("normalize_words", |b| {
        b.iter(|| black_box(normalize_words(black_box(candidate))))
    });

    c.bench_function("word_overlap_vs_pending", |b| {
        b.iter(|| {
            for text in &pending {
                black_box(word_overlap(candidate, text).is_duplicate());
            }
        })
    });
}

fn bench_sanitize_fts5(c: &mut Criterion) {
    c.bench_function("sanitize_fts5_query", |b| {
        b.iter(|| black_box(sanitize_fts5_query("where does \"alice\" live? (NOT bob*) OR near:3")))
    });
}

criterion_group!(benches, bench_cosine_similarity, bench_word_overlap, bench_sanitize_fts5);
criterion_main!(benches);
