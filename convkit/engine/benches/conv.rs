use criterion::{black_box, criterion_group, criterion_main, Criterion};
use convkit_engine::*;

fn make_data(len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|i| (i as f32 * 0.013).sin() * scale).collect()
}

fn desc_3x3(hw: usize, channels: usize, algorithm: Algorithm) -> ConvDesc {
    ConvDesc {
        dims: ConvDims {
            input: ActDims { n: 1, h: hw, w: hw, c: channels },
            weights: WeightDims { kh: 3, kw: 3, ic: channels, oc: channels },
            output: ActDims { n: 1, h: hw, w: hw, c: channels },
        },
        formats: Formats {
            input: ActLayout::Blocked,
            weights: WeightLayout::Hwio,
            output: ActLayout::Blocked,
        },
        algorithm,
        with_bias: true,
        with_relu: true,
        weights_reuse: WeightsReuse::Repeated,
        ..ConvDesc::default()
    }
}

fn bench_f32_strategies(c: &mut Criterion) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut group = c.benchmark_group("conv3x3_f32");
    for (name, algorithm) in [
        ("direct", Algorithm::Direct),
        ("winograd4", Algorithm::Winograd { tile_size: 4 }),
        ("winograd5", Algorithm::Winograd { tile_size: 5 }),
    ] {
        let desc = desc_3x3(28, 64, algorithm);
        let sizes = desc.sizes();
        let input = make_data(sizes.input, 1.0);
        let weights = make_data(sizes.weights, 0.1);
        let bias = make_data(sizes.bias, 0.5);
        let mut output = vec![0.0f32; sizes.output];
        let mut engine = match ConvolutionEngine::new(desc) {
            Ok(engine) => engine,
            Err(e) => panic!("{}: {}", name, e),
        };
        group.bench_function(format!("{}_28x28x64", name), |b| {
            b.iter(|| {
                engine
                    .execute_f32(black_box(&mut output), black_box(&input), &weights, Some(&bias))
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_pointwise(c: &mut Criterion) {
    let mut desc = desc_3x3(28, 128, Algorithm::Auto);
    desc.dims.weights.kh = 1;
    desc.dims.weights.kw = 1;
    desc.pads = [0; 4];
    let sizes = desc.sizes();
    let input = make_data(sizes.input, 1.0);
    let weights = make_data(sizes.weights, 0.1);
    let bias = make_data(sizes.bias, 0.5);
    let mut output = vec![0.0f32; sizes.output];
    let mut engine = ConvolutionEngine::new(desc).unwrap();
    assert_eq!(engine.strategy(), Strategy::Pointwise);
    c.bench_function("pointwise_28x28x128", |b| {
        b.iter(|| {
            engine
                .execute_f32(black_box(&mut output), black_box(&input), &weights, Some(&bias))
                .unwrap()
        })
    });
}

fn bench_int8(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv3x3_int8");
    for (name, output_dtype) in [("f32_out", DType::F32), ("u8_out", DType::U8)] {
        let desc = ConvDesc {
            precision: Precision::Int8,
            output_dtype,
            input_quant: QuantParams { scale: 0.02, zero_point: 128.0 },
            output_quant: QuantParams { scale: 0.05, zero_point: 0.0 },
            ..desc_3x3(28, 64, Algorithm::Auto)
        };
        let sizes = desc.sizes();
        let input: Vec<u8> = (0..sizes.input).map(|i| (i * 7 % 251) as u8).collect();
        let weights = make_data(sizes.weights, 0.1);
        let bias = make_data(sizes.bias, 0.5);
        let mut engine = ConvolutionEngine::new(desc).unwrap();
        match output_dtype {
            DType::U8 => {
                let mut output = vec![0u8; sizes.output];
                group.bench_function(name, |b| {
                    b.iter(|| {
                        engine
                            .execute_int8(black_box(&mut output), black_box(&input), &weights, Some(&bias))
                            .unwrap()
                    })
                });
            }
            _ => {
                let mut output = vec![0.0f32; sizes.output];
                group.bench_function(name, |b| {
                    b.iter(|| {
                        engine
                            .execute_int8(black_box(&mut output), black_box(&input), &weights, Some(&bias))
                            .unwrap()
                    })
                });
            }
        }
    }
    group.finish();
}

fn bench_weight_transform(c: &mut Criterion) {
    let mut desc = desc_3x3(14, 128, Algorithm::Winograd { tile_size: 5 });
    desc.weights_reuse = WeightsReuse::PerCall;
    let sizes = desc.sizes();
    let input = make_data(sizes.input, 1.0);
    let weights = make_data(sizes.weights, 0.1);
    let bias = make_data(sizes.bias, 0.5);
    let mut output = vec![0.0f32; sizes.output];
    let mut engine = ConvolutionEngine::new(desc).unwrap();
    c.bench_function("winograd5_per_call_weights_14x14x128", |b| {
        b.iter(|| {
            engine
                .execute_f32(black_box(&mut output), black_box(&input), &weights, Some(&bias))
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_f32_strategies, bench_pointwise, bench_int8, bench_weight_transform);
criterion_main!(benches);
