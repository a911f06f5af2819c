use criterion::{Criterion, criterion_group, criterion_main};
use semsearch::embeddings::truncate_text;
use semsearch::search::cosine_similarity;
use std::hint::black_box;

fn vector(seed: f64, dimension: usize) -> Vec<f64> {
    (0..dimension)
        .map(|i| ((i as f64 + seed) * 0.37).sin())
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let a = vector(1.0, 768);
    let b = vector(2.0, 768);
    c.bench_function("cosine_similarity_768", |bench| {
        bench.iter(|| cosine_similarity(black_box(&a), black_box(&b)))
    });

    // Fallback ranking scores up to 500 stored vectors per query
    let stored: Vec<Vec<f64>> = (0..500).map(|i| vector(f64::from(i), 768)).collect();
    c.bench_function("rank_500_documents", |bench| {
        bench.iter(|| {
            let mut scores: Vec<f64> = stored
                .iter()
                .map(|candidate| cosine_similarity(black_box(&a), candidate))
                .filter(|score| *score >= 0.7)
                .collect();
            scores.sort_by(|x, y| y.total_cmp(x));
            scores.truncate(10);
            scores
        })
    });

    let text = "lorem ipsum dolor sit amet ".repeat(400);
    c.bench_function("truncate_text_5000", |bench| {
        bench.iter(|| truncate_text(black_box(&text), black_box(5000)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
