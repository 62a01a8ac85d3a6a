use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ir_tensor::{
    BatchWindow, ComputeBackend, CpuBackend, DType, ExecutionPool, Shape, SimdBackend, Tensor,
};

fn make_values(n: usize) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * 0.01).sin()).collect()
}

fn backends() -> Vec<Box<dyn ComputeBackend>> {
    let pool = Arc::new(ExecutionPool::new(0).expect("pool"));
    vec![Box::new(CpuBackend::new()), Box::new(SimdBackend::new(pool))]
}

fn bench_dot_product(c: &mut Criterion) {
    let n = 4096;
    let a = Tensor::new(make_values(n), Shape::new(vec![n]));
    let mut group = c.benchmark_group("dot_product_4k");
    for b_dtype in [DType::F32, DType::BF16, DType::Q8, DType::Q4] {
        let b = a.quantize(b_dtype).expect("quantize");
        for backend in backends() {
            group.bench_function(format!("{}/f32x{}", backend.name(), b_dtype), |bench| {
                bench.iter(|| {
                    backend
                        .dot_product(black_box(&a.view()), black_box(&b.view()), 0, 0, n)
                        .expect("dot")
                })
            });
        }
    }
    group.finish();
}

fn bench_batch_dot_product(c: &mut Criterion) {
    let (rows, cols) = (1024, 1024);
    let a = Tensor::new(make_values(cols), Shape::new(vec![1, cols]));
    let weights = Tensor::new(make_values(rows * cols), Shape::new(vec![rows, cols]));
    let mut group = c.benchmark_group("batch_dot_product_1x1024x1024");
    for w_dtype in [DType::F32, DType::Q4] {
        let w = weights.quantize(w_dtype).expect("quantize");
        for backend in backends() {
            let mut out = Tensor::zeros(DType::F32, Shape::new(vec![1, rows]));
            group.bench_function(format!("{}/f32x{}", backend.name(), w_dtype), |bench| {
                bench.iter(|| {
                    let mut view = out.view_mut().expect("owned");
                    backend
                        .batch_dot_product(&mut view, &a.view(), &w.view(), BatchWindow::full(cols, rows))
                        .expect("batch")
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_dot_product, bench_batch_dot_product);
criterion_main!(benches);
