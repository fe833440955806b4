use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use fastpath_bench::datatype::Precision;
use fastpath_bench::device::Device;
use fastpath_bench::model::{from_pretrained, BertForSequenceClassification, SequenceClassifier};
use fastpath_bench::tensor::TokenBatch;

fn prepared(fast: bool, precision: Precision) -> BertForSequenceClassification {
    let mut model = from_pretrained("bert-tiny").expect("bert-tiny is registered");
    if fast {
        model.encoder = model.encoder.to_fast().expect("tiny encoder converts");
    }
    model.eval().cast(precision)
}

fn bench_encoders(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoder");
    let mut rng = StdRng::seed_from_u64(0);

    for seq_len in [16, 64] {
        let batch = TokenBatch::random(&mut rng, 4, seq_len, 1..25000, Device::Cpu)
            .expect("valid batch");
        for (name, fast) in [("baseline", false), ("fast_path", true)] {
            let model = prepared(fast, Precision::F32);
            group.bench_with_input(BenchmarkId::new(name, seq_len), &batch, |b, batch| {
                b.iter(|| model.forward(black_box(batch)).expect("forward"))
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_encoders);
criterion_main!(benches);
