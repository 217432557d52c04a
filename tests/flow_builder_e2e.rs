use burn_ndarray::NdArray;
use burn_core::tensor::Tensor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use seqinfer::flow::{build_flow, BaseDistribution, EventShape, Flow, FlowOptions};
use seqinfer::link::LinkTransform;
use seqinfer::registry::{
    init_affine_diag, FlowBuilderRegistry, Kwargs, TransformArgs, TransformEntry, TransformRegistry,
};
use seqinfer::tensor::{burn_to_ndarray_2, to_vec};
use seqinfer::transforms::{FlowTransform, Permute};
use seqinfer::{Error, Result};

type B = NdArray<f32>;

fn shuffle_ctor(
    dim: usize,
    _context_dim: usize,
    _args: &TransformArgs,
    rng: &mut ChaCha8Rng,
    _device: &<B as burn_core::tensor::backend::Backend>::Device,
) -> Result<FlowTransform<B>> {
    Ok(FlowTransform::Permute(Permute::random(dim, rng)))
}

fn shuffled_flow(
    event_shape: &EventShape,
    link: LinkTransform,
    options: &FlowOptions,
    transforms: &TransformRegistry<B>,
    device: &<B as burn_core::tensor::backend::Backend>::Device,
) -> Result<Flow<B>> {
    build_flow(event_shape, link, "shuffle", options, transforms, device)
}

#[test]
fn unknown_and_duplicate_names_are_config_errors() {
    let device = Default::default();
    let transforms = TransformRegistry::<B>::with_defaults();
    let mut builders = FlowBuilderRegistry::<B>::with_defaults();

    let err = builders.build(
        "realnvp",
        &EventShape::Dim(3),
        LinkTransform::Identity,
        &FlowOptions::default(),
        &transforms,
        &device,
    );
    assert!(matches!(err, Err(Error::Config(_))));

    let dup = builders.register("MAF", shuffled_flow);
    assert!(matches!(dup, Err(Error::Config(_))));

    let bad_shape = builders.build(
        "maf",
        &EventShape::Shape(vec![]),
        LinkTransform::Identity,
        &FlowOptions::default(),
        &transforms,
        &device,
    );
    assert!(matches!(bad_shape, Err(Error::Config(_))));
}

#[test]
fn custom_transform_and_builder_plug_into_the_registries() -> Result<()> {
    let device = Default::default();
    let mut transforms = TransformRegistry::<B>::with_defaults();
    transforms.register(
        "shuffle",
        TransformEntry {
            ctor: shuffle_ctor,
            init: init_affine_diag,
            keywords: &[],
        },
    )?;
    let mut builders = FlowBuilderRegistry::<B>::with_defaults();
    builders.register("shuffled", shuffled_flow)?;
    assert!(builders.names().contains(&"shuffled"));

    let options = FlowOptions {
        num_flows: 3,
        permute: false,
        ..FlowOptions::default()
    };
    let flow = builders.build("shuffled", &EventShape::Dim(4), LinkTransform::Identity, &options, &transforms, &device)?;
    assert_eq!(flow.layer_kinds(), vec!["permute", "permute", "permute"]);

    // Permutations are volume-preserving: the density is the base density.
    let y = Tensor::<B, 2>::from_floats([[0.1, -0.2, 0.3, 0.0]], &device);
    let lp = to_vec(flow.log_prob(y, None)?)?;
    let expected = -0.5 * (0.01 + 0.04 + 0.09) - 2.0 * (2.0 * std::f32::consts::PI).ln();
    assert!((lp[0] - expected).abs() < 1e-4, "log-prob {:.5} expected {:.5}", lp[0], expected);
    Ok(())
}

#[test]
fn stick_breaking_flows_live_on_the_simplex() -> Result<()> {
    let device = Default::default();
    let transforms = TransformRegistry::<B>::with_defaults();
    let builders = FlowBuilderRegistry::<B>::default();
    let options = FlowOptions {
        num_flows: 2,
        seed: 1,
        ..FlowOptions::default()
    };
    let flow = builders.build("nsf", &EventShape::Dim(5), LinkTransform::StickBreaking, &options, &transforms, &device)?;
    assert_eq!(flow.dim(), 4);
    assert_eq!(flow.event_dim(), 5);

    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let samples = burn_to_ndarray_2(flow.sample(32, None, &mut rng, &device)?)?;
    assert_eq!(samples.dim(), (32, 5));
    for row in samples.rows() {
        let total: f32 = row.sum();
        assert!((total - 1.0).abs() < 1e-4, "row sums to {total:.6}");
        assert!(row.iter().all(|&v| v > 0.0));
    }

    let lp = to_vec(flow.log_prob(burn_core::tensor::Tensor::from_data(
        burn_core::tensor::TensorData::new(samples.iter().copied().collect::<Vec<f32>>(), [32, 5]),
        &device,
    ), None)?)?;
    assert!(lp.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn gaussian_builders_use_a_single_layer() -> Result<()> {
    let device = Default::default();
    let transforms = TransformRegistry::<B>::with_defaults();
    let builders = FlowBuilderRegistry::<B>::with_defaults();
    let options = FlowOptions {
        num_flows: 7,
        batch_norm: true,
        base: Some(BaseDistribution::DiagNormal {
            loc: vec![1.0; 3],
            scale: vec![2.0; 3],
        }),
        ..FlowOptions::default()
    };
    let full = builders.build("gaussian", &EventShape::Dim(3), LinkTransform::Identity, &options, &transforms, &device)?;
    assert_eq!(full.layer_kinds(), vec!["affine_tril"]);
    assert_eq!(full.base(), &BaseDistribution::StandardNormal);

    let diag = builders.build("gaussian_diag", &EventShape::Dim(3), LinkTransform::Identity, &options, &transforms, &device)?;
    assert_eq!(diag.layer_kinds(), vec!["affine_diag"]);
    Ok(())
}

#[test]
fn flow_options_kwargs_reach_the_transforms() -> Result<()> {
    let device = Default::default();
    let transforms = TransformRegistry::<B>::with_defaults();
    let builders = FlowBuilderRegistry::<B>::with_defaults();

    let mut overrides = Kwargs::new();
    overrides.insert("count_bins".into(), 4usize.into());
    let args = transforms.args_for("spline_coupling", 4, &overrides)?;
    assert_eq!(args.kwarg_usize("count_bins")?, 4);
    assert_eq!(args.kwarg_str("order")?, "linear");

    let cubic = FlowOptions::default().with_kwarg("order", "cubic");
    let err = builders.build("scf", &EventShape::Dim(4), LinkTransform::Identity, &cubic, &transforms, &device);
    assert!(matches!(err, Err(Error::Config(_))));

    let quadratic = FlowOptions::default().with_kwarg("order", "quadratic");
    let flow = builders.build("nsf", &EventShape::Dim(3), LinkTransform::Identity, &quadratic, &transforms, &device)?;
    let y = Tensor::<B, 2>::from_floats([[0.2, -0.4, 1.3], [2.0, 0.1, -0.7]], &device);
    let lp = to_vec(flow.log_prob(y, None)?)?;
    assert!(lp.iter().all(|v| v.is_finite()));

    let options = FlowOptions {
        num_flows: 2,
        batch_norm: true,
        ..FlowOptions::default()
    }
    .with_kwarg("count_bins", 6usize)
    .with_kwarg("hidden_dims", vec![16usize, 16]);
    let flow = builders.build("scf", &EventShape::Dim(4), LinkTransform::Identity, &options, &transforms, &device)?;
    assert_eq!(
        flow.layer_kinds(),
        vec!["spline_coupling", "permute", "batch_norm", "spline_coupling"]
    );
    Ok(())
}
