//! Composed normalizing flows.
//!
//! A [`Flow`] is a base distribution pushed through an ordered list of [`FlowTransform`]s and a
//! final [`LinkTransform`]. Sampling runs the layers in order; density evaluation runs them in
//! reverse, through each layer's parallel `to_base` pass.

use burn_core as burn;

use burn::module::{Ignored, Module};
use burn::tensor::{backend::Backend, Tensor};
use ndarray::Array2;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::link::LinkTransform;
use crate::registry::{Kwargs, TransformRegistry};
use crate::tensor::{broadcast_rows, ndarray_to_burn_2, row_tensor};
use crate::transforms::{BatchNorm, FlowTransform, Permute};
use crate::{Error, Result};

const LN_2PI: f32 = 1.837_877_1;

/// Event shape of the distribution a flow models.
///
/// A bare size or a shape whose last entry is the event dimension; empty or zero-sized shapes
/// are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventShape {
    Dim(usize),
    Shape(Vec<usize>),
}

impl EventShape {
    pub fn event_dim(&self) -> Result<usize> {
        let d = match self {
            Self::Dim(d) => *d,
            Self::Shape(s) => *s
                .last()
                .ok_or_else(|| Error::Config("event shape must not be empty".into()))?,
        };
        if d == 0 {
            return Err(Error::Config("event dimension must be >= 1".into()));
        }
        Ok(d)
    }
}

impl From<usize> for EventShape {
    fn from(d: usize) -> Self {
        Self::Dim(d)
    }
}

impl From<Vec<usize>> for EventShape {
    fn from(s: Vec<usize>) -> Self {
        Self::Shape(s)
    }
}

/// Base distribution of a flow, in the working dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BaseDistribution {
    #[default]
    StandardNormal,
    DiagNormal { loc: Vec<f32>, scale: Vec<f32> },
}

impl BaseDistribution {
    pub fn validate(&self, dim: usize) -> Result<()> {
        match self {
            Self::StandardNormal => Ok(()),
            Self::DiagNormal { loc, scale } => {
                if loc.len() != dim || scale.len() != dim {
                    return Err(Error::Config(format!(
                        "base distribution must have dimension {dim}"
                    )));
                }
                if scale.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
                    return Err(Error::Config("base scale entries must be positive".into()));
                }
                Ok(())
            }
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, n: usize, dim: usize, rng: &mut R) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((n, dim));
        for v in out.iter_mut() {
            *v = StandardNormal.sample(rng);
        }
        if let Self::DiagNormal { loc, scale } = self {
            for mut row in out.outer_iter_mut() {
                for k in 0..dim {
                    row[k] = loc[k] + scale[k] * row[k];
                }
            }
        }
        out
    }

    pub fn log_prob<B: Backend>(&self, z: Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, d] = z.dims();
        let device = z.device();
        let (z, log_norm) = match self {
            Self::StandardNormal => (z, 0.5 * d as f32 * LN_2PI),
            Self::DiagNormal { loc, scale } => {
                let log_scale: f32 = scale.iter().map(|s| s.ln()).sum();
                (
                    (z - row_tensor::<B>(loc, &device)) / row_tensor::<B>(scale, &device),
                    log_scale + 0.5 * d as f32 * LN_2PI,
                )
            }
        };
        (z.clone() * z)
            .sum_dim(1)
            .mul_scalar(-0.5)
            .sub_scalar(log_norm)
            .reshape([n])
    }
}

/// Options shared by all flow builders.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    /// Number of learned layers.
    pub num_flows: usize,
    /// Insert a random permutation between consecutive layers.
    pub permute: bool,
    /// Insert batch normalization between consecutive layers.
    pub batch_norm: bool,
    /// Base distribution; `None` means standard normal.
    pub base: Option<BaseDistribution>,
    /// Width of the conditioning input (0 for an unconditional flow).
    pub context_dim: usize,
    /// Seeds weights and permutations.
    pub seed: u64,
    /// Overrides forwarded to every transform's init defaults.
    pub kwargs: Kwargs,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            num_flows: 5,
            permute: true,
            batch_norm: false,
            base: None,
            context_dim: 0,
            seed: 0,
            kwargs: Kwargs::new(),
        }
    }
}

impl FlowOptions {
    pub fn with_kwarg(mut self, key: &str, value: impl Into<crate::registry::ArgValue>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }
}

/// A (conditional) normalizing flow.
#[derive(Module, Debug)]
pub struct Flow<B: Backend> {
    transforms: Vec<FlowTransform<B>>,
    base: Ignored<BaseDistribution>,
    link: Ignored<LinkTransform>,
    dim: usize,
    event_dim: usize,
    context_dim: usize,
}

impl<B: Backend> Flow<B> {
    pub fn new(
        transforms: Vec<FlowTransform<B>>,
        base: BaseDistribution,
        link: LinkTransform,
        dim: usize,
        event_dim: usize,
        context_dim: usize,
    ) -> Self {
        Self {
            transforms,
            base: Ignored(base),
            link: Ignored(link),
            dim,
            event_dim,
            context_dim,
        }
    }

    /// Working (pre-link) dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Nominal event dimension (post-link).
    pub fn event_dim(&self) -> usize {
        self.event_dim
    }

    pub fn context_dim(&self) -> usize {
        self.context_dim
    }

    pub fn link(&self) -> &LinkTransform {
        &self.link
    }

    pub fn base(&self) -> &BaseDistribution {
        &self.base
    }

    /// Layer kinds in sampling order.
    pub fn layer_kinds(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.kind()).collect()
    }

    fn context_for(&self, n: usize, context: Option<Tensor<B, 2>>) -> Result<Option<Tensor<B, 2>>> {
        match (self.context_dim, context) {
            (0, None) => Ok(None),
            (0, Some(_)) => Err(Error::Shape("unconditional flow was given a context")),
            (_, None) => Err(Error::Shape("conditional flow needs a context")),
            (c, Some(ctx)) => {
                if ctx.dims()[1] != c {
                    return Err(Error::Shape("context width does not match the flow"));
                }
                broadcast_rows(ctx, n).map(Some)
            }
        }
    }

    /// Per-row log-density of `[n, event_dim]` values.
    pub fn log_prob(&self, value: Tensor<B, 2>, context: Option<Tensor<B, 2>>) -> Result<Tensor<B, 1>> {
        let [n, d] = value.dims();
        if d != self.event_dim {
            return Err(Error::Shape("values must have the flow's event dimension"));
        }
        let ctx = self.context_for(n, context)?;
        let (mut z, mut lad) = self.link.to_base(value);
        for t in self.transforms.iter().rev() {
            let (next, l) = t.to_base(z, ctx.clone());
            z = next;
            lad = lad + l;
        }
        Ok(self.base.log_prob(z) + lad)
    }

    /// Push base-space noise `[n, dim]` through the flow.
    pub fn transform_noise(&self, noise: Tensor<B, 2>, context: Option<Tensor<B, 2>>) -> Result<Tensor<B, 2>> {
        let [n, d] = noise.dims();
        if d != self.dim {
            return Err(Error::Shape("noise must have the flow's working dimension"));
        }
        let ctx = self.context_for(n, context)?;
        let mut y = noise;
        for t in &self.transforms {
            y = t.to_data(y, ctx.clone()).0;
        }
        Ok(self.link.to_data(y).0)
    }

    /// Draw `n` samples; a single-row context is shared by all samples.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n: usize,
        context: Option<Tensor<B, 2>>,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Tensor<B, 2>> {
        let noise = self.base.sample(n, self.dim, rng);
        self.transform_noise(ndarray_to_burn_2::<B>(device, &noise.view()), context)
    }
}

/// Working dimension for `link` so that its output has `event_dim` coordinates.
///
/// The link is probed once at the nominal dimension; whatever it adds (or removes) is taken off
/// (or put back). A second probe confirms the result.
pub fn working_dim<B: Backend>(link: &LinkTransform, event_dim: usize, device: &B::Device) -> Result<usize> {
    link.validate(event_dim)?;
    let out = link.probe_output_dim::<B>(event_dim, device) as isize;
    let working = event_dim as isize - (out - event_dim as isize);
    if working < 1 {
        return Err(Error::Config(format!(
            "{} link leaves no working dimension for event dimension {event_dim}",
            link.name()
        )));
    }
    let working = working as usize;
    if link.probe_output_dim::<B>(working, device) != event_dim {
        return Err(Error::Config(format!(
            "{} link does not map dimension {working} onto {event_dim}",
            link.name()
        )));
    }
    Ok(working)
}

/// Assemble a flow from `num_flows` copies of the registered transform `transform`.
///
/// Layout in sampling order: `T₁ [P₁] [BN₁] T₂ … Tₙ`, then the link. Permutations and batch
/// normalization only go between learned layers. With `num_flows = 0` the flow is the base
/// distribution pushed through the link; the transform name and kwargs are still checked.
pub fn build_flow<B: Backend>(
    event_shape: &EventShape,
    link: LinkTransform,
    transform: &str,
    options: &FlowOptions,
    registry: &TransformRegistry<B>,
    device: &B::Device,
) -> Result<Flow<B>> {
    let event_dim = event_shape.event_dim()?;
    let dim = working_dim::<B>(&link, event_dim, device)?;
    let base = options.base.clone().unwrap_or_default();
    base.validate(dim)?;
    if options.num_flows == 0 {
        registry.args_for(transform, dim, &options.kwargs)?;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    let mut transforms = Vec::new();
    for i in 0..options.num_flows {
        transforms.push(registry.build(transform, dim, options.context_dim, &options.kwargs, &mut rng, device)?);
        let between = i + 1 < options.num_flows;
        if options.permute && between {
            transforms.push(FlowTransform::Permute(Permute::random(dim, &mut rng)));
        }
        if options.batch_norm && between {
            transforms.push(FlowTransform::BatchNorm(BatchNorm::new(dim, device)));
        }
    }
    log::debug!(
        "built {transform} flow: event_dim={event_dim} working_dim={dim} layers={} link={}",
        transforms.len(),
        link.name()
    );
    Ok(Flow::new(transforms, base, link, dim, event_dim, options.context_dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TransformRegistry;
    use crate::tensor::to_vec;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn event_shapes() {
        assert_eq!(EventShape::Dim(3).event_dim().unwrap(), 3);
        assert_eq!(EventShape::Shape(vec![2, 4]).event_dim().unwrap(), 4);
        assert!(EventShape::Shape(vec![]).event_dim().is_err());
        assert!(EventShape::Dim(0).event_dim().is_err());
    }

    #[test]
    fn stick_breaking_shrinks_the_working_dimension() {
        let device = Default::default();
        assert_eq!(working_dim::<B>(&LinkTransform::StickBreaking, 5, &device).unwrap(), 4);
        assert_eq!(working_dim::<B>(&LinkTransform::Exp, 5, &device).unwrap(), 5);
    }

    #[test]
    fn layout_interleaves_permutations_only_between_layers() {
        let device = Default::default();
        let registry = TransformRegistry::<B>::with_defaults();
        let opts = FlowOptions {
            num_flows: 3,
            batch_norm: true,
            ..FlowOptions::default()
        };
        let flow = build_flow(&EventShape::Dim(3), LinkTransform::Identity, "affine_autoregressive", &opts, &registry, &device).unwrap();
        assert_eq!(
            flow.layer_kinds(),
            vec![
                "affine_autoregressive",
                "permute",
                "batch_norm",
                "affine_autoregressive",
                "permute",
                "batch_norm",
                "affine_autoregressive",
            ]
        );
    }

    #[test]
    fn samples_land_in_the_link_support() {
        let device = Default::default();
        let registry = TransformRegistry::<B>::with_defaults();
        let opts = FlowOptions {
            num_flows: 2,
            ..FlowOptions::default()
        };
        let flow = build_flow(&EventShape::Dim(4), LinkTransform::StickBreaking, "affine_coupling", &opts, &registry, &device).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let y = flow.sample(16, None, &mut rng, &device).unwrap();
        assert_eq!(y.dims(), [16, 4]);
        let lp = to_vec(flow.log_prob(y.clone(), None).unwrap()).unwrap();
        assert!(lp.iter().all(|v| v.is_finite()));
        for row in to_vec(y).unwrap().chunks(4) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn zero_layers_leave_only_the_link() {
        let device = Default::default();
        let registry = TransformRegistry::<B>::with_defaults();
        let opts = FlowOptions {
            num_flows: 0,
            ..FlowOptions::default()
        };
        let flow = build_flow(&EventShape::Dim(2), LinkTransform::Exp, "spline_coupling", &opts, &registry, &device).unwrap();
        assert!(flow.layer_kinds().is_empty());

        // Log-normal density: N(log y; 0, I) / prod(y).
        let y = [0.5f32, 2.0];
        let lp = to_vec(flow.log_prob(Tensor::<B, 2>::from_floats([y], &device), None).unwrap()).unwrap();
        let expected: f32 = y
            .iter()
            .map(|v| -0.5 * v.ln() * v.ln() - 0.5 * (2.0 * std::f32::consts::PI).ln() - v.ln())
            .sum();
        assert!((lp[0] - expected).abs() < 1e-4, "log-prob {} expected {expected}", lp[0]);

        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let samples = to_vec(flow.sample(8, None, &mut rng, &device).unwrap()).unwrap();
        assert!(samples.iter().all(|&v| v > 0.0));

        assert!(build_flow(&EventShape::Dim(2), LinkTransform::Exp, "realnvp", &opts, &registry, &device).is_err());
    }

    #[test]
    fn context_is_required_exactly_when_declared() {
        let device = Default::default();
        let registry = TransformRegistry::<B>::with_defaults();
        let opts = FlowOptions {
            num_flows: 1,
            context_dim: 2,
            ..FlowOptions::default()
        };
        let flow = build_flow(&EventShape::Dim(2), LinkTransform::Identity, "affine_autoregressive", &opts, &registry, &device).unwrap();
        let theta = Tensor::<B, 2>::zeros([3, 2], &device);
        assert!(flow.log_prob(theta.clone(), None).is_err());
        let ctx = Tensor::<B, 2>::zeros([1, 2], &device);
        assert_eq!(flow.log_prob(theta, Some(ctx)).unwrap().dims(), [3]);
    }
}
