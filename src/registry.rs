//! Transform and flow-builder registries.
//!
//! Both registries are explicit values: construct one (usually with `with_defaults`), optionally
//! register more entries, and hand it to whatever builds flows. Names are case-insensitive;
//! registering a name twice or looking up an unknown name is a configuration error.
//!
//! A transform entry couples a constructor with an *init* function that computes defaults from
//! the input dimension (e.g. hidden widths `5·dim + 5`). Caller keyword arguments are passed to
//! the init and then merged on top of its keyword defaults, restricted to the keywords the
//! constructor accepts; the caller always wins.

use burn_core as burn;

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use rand_chacha::ChaCha8Rng;

use crate::flow::{build_flow, EventShape, Flow, FlowOptions};
use crate::link::LinkTransform;
use crate::spline::SplineOrder;
use crate::transforms::{
    AffineAutoregressive, AffineCoupling, AffineDiag, AffineTril, FlowTransform, SplineAutoregressive,
    SplineCoupling,
};
use crate::{Error, Result};

/// A configuration value passed to a transform.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Dims(Vec<usize>),
    Floats(Vec<f32>),
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<usize> for ArgValue {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<Vec<usize>> for ArgValue {
    fn from(v: Vec<usize>) -> Self {
        Self::Dims(v)
    }
}

impl From<Vec<f32>> for ArgValue {
    fn from(v: Vec<f32>) -> Self {
        Self::Floats(v)
    }
}

pub type Kwargs = BTreeMap<String, ArgValue>;

/// Positional and keyword arguments for one transform constructor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformArgs {
    pub args: Vec<ArgValue>,
    pub kwargs: Kwargs,
}

fn type_error(what: &str, expected: &str) -> Error {
    Error::Config(format!("argument `{what}` must be {expected}"))
}

fn as_usize(v: &ArgValue, what: &str) -> Result<usize> {
    match v {
        ArgValue::Int(i) if *i >= 0 => Ok(*i as usize),
        _ => Err(type_error(what, "a non-negative integer")),
    }
}

fn as_f64(v: &ArgValue, what: &str) -> Result<f64> {
    match v {
        ArgValue::Float(f) => Ok(*f),
        ArgValue::Int(i) => Ok(*i as f64),
        _ => Err(type_error(what, "a number")),
    }
}

impl TransformArgs {
    fn arg(&self, pos: usize) -> Result<&ArgValue> {
        self.args
            .get(pos)
            .ok_or_else(|| Error::Config(format!("missing positional argument {pos}")))
    }

    fn kwarg(&self, key: &str) -> Result<&ArgValue> {
        self.kwargs
            .get(key)
            .ok_or_else(|| Error::Config(format!("missing keyword argument `{key}`")))
    }

    pub fn arg_usize(&self, pos: usize) -> Result<usize> {
        as_usize(self.arg(pos)?, &format!("#{pos}"))
    }

    pub fn arg_dims(&self, pos: usize) -> Result<Vec<usize>> {
        match self.arg(pos)? {
            ArgValue::Dims(d) => Ok(d.clone()),
            _ => Err(type_error(&format!("#{pos}"), "a list of sizes")),
        }
    }

    pub fn kwarg_usize(&self, key: &str) -> Result<usize> {
        as_usize(self.kwarg(key)?, key)
    }

    pub fn kwarg_f64(&self, key: &str) -> Result<f64> {
        as_f64(self.kwarg(key)?, key)
    }

    pub fn kwarg_str(&self, key: &str) -> Result<&str> {
        match self.kwarg(key)? {
            ArgValue::Str(s) => Ok(s),
            _ => Err(type_error(key, "a string")),
        }
    }

    pub fn kwarg_floats(&self, key: &str) -> Result<&[f32]> {
        match self.kwarg(key)? {
            ArgValue::Floats(v) => Ok(v),
            _ => Err(type_error(key, "a list of floats")),
        }
    }
}

/// Computes constructor arguments from the input dimension and the caller's overrides.
pub type TransformInit = fn(dim: usize, overrides: &Kwargs) -> Result<TransformArgs>;

/// Builds one transform instance.
pub type TransformCtor<B> = fn(
    dim: usize,
    context_dim: usize,
    args: &TransformArgs,
    rng: &mut ChaCha8Rng,
    device: &<B as Backend>::Device,
) -> Result<FlowTransform<B>>;

pub struct TransformEntry<B: Backend> {
    pub ctor: TransformCtor<B>,
    pub init: TransformInit,
    /// Keywords the constructor accepts; other caller keywords are ignored for this entry.
    pub keywords: &'static [&'static str],
}

pub struct TransformRegistry<B: Backend> {
    entries: BTreeMap<String, TransformEntry<B>>,
}

impl<B: Backend> Default for TransformRegistry<B> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<B: Backend> TransformRegistry<B> {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry holding the six built-in transforms.
    pub fn with_defaults() -> Self {
        let mut r = Self::empty();
        let builtins: [(&str, TransformEntry<B>); 6] = [
            (
                "affine_autoregressive",
                TransformEntry {
                    ctor: build_affine_autoregressive::<B>,
                    init: init_affine_autoregressive,
                    keywords: &["log_scale_min_clip", "log_scale_max_clip"],
                },
            ),
            (
                "spline_autoregressive",
                TransformEntry {
                    ctor: build_spline_autoregressive::<B>,
                    init: init_spline_autoregressive,
                    keywords: &["count_bins", "bound", "order"],
                },
            ),
            (
                "affine_coupling",
                TransformEntry {
                    ctor: build_affine_coupling::<B>,
                    init: init_affine_coupling,
                    keywords: &["log_scale_min_clip", "log_scale_max_clip"],
                },
            ),
            (
                "spline_coupling",
                TransformEntry {
                    ctor: build_spline_coupling::<B>,
                    init: init_spline_coupling,
                    keywords: &["count_bins", "bound", "order"],
                },
            ),
            (
                "affine_diag",
                TransformEntry {
                    ctor: build_affine_diag::<B>,
                    init: init_affine_diag,
                    keywords: &["loc", "scale"],
                },
            ),
            (
                "affine_tril",
                TransformEntry {
                    ctor: build_affine_tril::<B>,
                    init: init_affine_tril,
                    keywords: &["loc", "scale_tril"],
                },
            ),
        ];
        for (name, entry) in builtins {
            r.entries.insert(name.to_string(), entry);
        }
        r
    }

    pub fn register(&mut self, name: &str, entry: TransformEntry<B>) -> Result<()> {
        let key = name.to_lowercase();
        if self.entries.contains_key(&key) {
            return Err(Error::Config(format!("transform `{key}` is already registered")));
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    fn entry(&self, name: &str) -> Result<&TransformEntry<B>> {
        let key = name.to_lowercase();
        self.entries.get(&key).ok_or_else(|| {
            Error::Config(format!(
                "unknown transform `{key}`; registered: {}",
                self.names().join(", ")
            ))
        })
    }

    /// Constructor arguments for `name` at `dim`: init defaults with accepted overrides on top.
    pub fn args_for(&self, name: &str, dim: usize, overrides: &Kwargs) -> Result<TransformArgs> {
        let entry = self.entry(name)?;
        let mut args = (entry.init)(dim, overrides)?;
        for (k, v) in overrides {
            if entry.keywords.contains(&k.as_str()) {
                args.kwargs.insert(k.clone(), v.clone());
            }
        }
        Ok(args)
    }

    pub fn build(
        &self,
        name: &str,
        dim: usize,
        context_dim: usize,
        overrides: &Kwargs,
        rng: &mut ChaCha8Rng,
        device: &B::Device,
    ) -> Result<FlowTransform<B>> {
        let args = self.args_for(name, dim, overrides)?;
        (self.entry(name)?.ctor)(dim, context_dim, &args, rng, device)
    }
}

fn default_hidden(dim: usize, layers: usize) -> Vec<usize> {
    vec![5 * dim + 5; layers]
}

/// `hidden_dims` from the caller if given, else the default.
fn hidden_dims(dim: usize, layers: usize, overrides: &Kwargs) -> Result<ArgValue> {
    match overrides.get("hidden_dims") {
        Some(ArgValue::Dims(d)) => Ok(ArgValue::Dims(d.clone())),
        Some(_) => Err(type_error("hidden_dims", "a list of sizes")),
        None => Ok(ArgValue::Dims(default_hidden(dim, layers))),
    }
}

fn split_dim(dim: usize, overrides: &Kwargs) -> Result<ArgValue> {
    if dim < 2 {
        return Err(Error::Config(format!("coupling transforms need dim >= 2, got {dim}")));
    }
    match overrides.get("split_dim") {
        Some(v) => Ok(ArgValue::Int(as_usize(v, "split_dim")? as i64)),
        None => Ok(ArgValue::Int((dim / 2) as i64)),
    }
}

fn clip_defaults() -> Kwargs {
    let mut k = Kwargs::new();
    k.insert("log_scale_min_clip".into(), ArgValue::Float(-3.0));
    k.insert("log_scale_max_clip".into(), ArgValue::Float(3.0));
    k
}

fn spline_defaults() -> Kwargs {
    let mut k = Kwargs::new();
    k.insert("count_bins".into(), ArgValue::Int(10));
    k.insert("bound".into(), ArgValue::Float(5.0));
    k.insert("order".into(), ArgValue::Str(SplineOrder::default().as_str().into()));
    k
}

pub fn init_affine_autoregressive(dim: usize, overrides: &Kwargs) -> Result<TransformArgs> {
    Ok(TransformArgs {
        args: vec![hidden_dims(dim, 1, overrides)?],
        kwargs: clip_defaults(),
    })
}

pub fn init_spline_autoregressive(dim: usize, overrides: &Kwargs) -> Result<TransformArgs> {
    Ok(TransformArgs {
        args: vec![ArgValue::Int(dim as i64), hidden_dims(dim, 1, overrides)?],
        kwargs: spline_defaults(),
    })
}

pub fn init_affine_coupling(dim: usize, overrides: &Kwargs) -> Result<TransformArgs> {
    Ok(TransformArgs {
        args: vec![split_dim(dim, overrides)?, hidden_dims(dim, 2, overrides)?],
        kwargs: clip_defaults(),
    })
}

pub fn init_spline_coupling(dim: usize, overrides: &Kwargs) -> Result<TransformArgs> {
    Ok(TransformArgs {
        args: vec![
            ArgValue::Int(dim as i64),
            split_dim(dim, overrides)?,
            hidden_dims(dim, 2, overrides)?,
        ],
        kwargs: spline_defaults(),
    })
}

pub fn init_affine_diag(dim: usize, _overrides: &Kwargs) -> Result<TransformArgs> {
    let mut kwargs = Kwargs::new();
    kwargs.insert("loc".into(), ArgValue::Floats(vec![0.0; dim]));
    kwargs.insert("scale".into(), ArgValue::Floats(vec![1.0; dim]));
    Ok(TransformArgs { args: vec![], kwargs })
}

pub fn init_affine_tril(dim: usize, _overrides: &Kwargs) -> Result<TransformArgs> {
    let mut eye = vec![0.0f32; dim * dim];
    for i in 0..dim {
        eye[i * dim + i] = 1.0;
    }
    let mut kwargs = Kwargs::new();
    kwargs.insert("loc".into(), ArgValue::Floats(vec![0.0; dim]));
    kwargs.insert("scale_tril".into(), ArgValue::Floats(eye));
    Ok(TransformArgs { args: vec![], kwargs })
}

fn spline_order(args: &TransformArgs) -> Result<SplineOrder> {
    args.kwarg_str("order")?.parse()
}

fn build_affine_autoregressive<B: Backend>(
    dim: usize,
    context_dim: usize,
    args: &TransformArgs,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Result<FlowTransform<B>> {
    Ok(FlowTransform::AffineAutoregressive(AffineAutoregressive::new(
        dim,
        context_dim,
        &args.arg_dims(0)?,
        args.kwarg_f64("log_scale_min_clip")?,
        args.kwarg_f64("log_scale_max_clip")?,
        rng,
        device,
    )?))
}

fn build_spline_autoregressive<B: Backend>(
    dim: usize,
    context_dim: usize,
    args: &TransformArgs,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Result<FlowTransform<B>> {
    let order = spline_order(args)?;
    if args.arg_usize(0)? != dim {
        return Err(Error::Config("spline_autoregressive: input dimension mismatch".into()));
    }
    Ok(FlowTransform::SplineAutoregressive(SplineAutoregressive::new(
        dim,
        context_dim,
        &args.arg_dims(1)?,
        args.kwarg_usize("count_bins")?,
        args.kwarg_f64("bound")?,
        order,
        rng,
        device,
    )?))
}

fn build_affine_coupling<B: Backend>(
    dim: usize,
    context_dim: usize,
    args: &TransformArgs,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Result<FlowTransform<B>> {
    Ok(FlowTransform::AffineCoupling(AffineCoupling::new(
        dim,
        context_dim,
        args.arg_usize(0)?,
        &args.arg_dims(1)?,
        args.kwarg_f64("log_scale_min_clip")?,
        args.kwarg_f64("log_scale_max_clip")?,
        rng,
        device,
    )?))
}

fn build_spline_coupling<B: Backend>(
    dim: usize,
    context_dim: usize,
    args: &TransformArgs,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Result<FlowTransform<B>> {
    let order = spline_order(args)?;
    if args.arg_usize(0)? != dim {
        return Err(Error::Config("spline_coupling: input dimension mismatch".into()));
    }
    Ok(FlowTransform::SplineCoupling(SplineCoupling::new(
        dim,
        context_dim,
        args.arg_usize(1)?,
        &args.arg_dims(2)?,
        args.kwarg_usize("count_bins")?,
        args.kwarg_f64("bound")?,
        order,
        rng,
        device,
    )?))
}

fn build_affine_diag<B: Backend>(
    dim: usize,
    context_dim: usize,
    args: &TransformArgs,
    _rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Result<FlowTransform<B>> {
    Ok(FlowTransform::AffineDiag(AffineDiag::new(
        dim,
        context_dim,
        args.kwarg_floats("loc")?,
        args.kwarg_floats("scale")?,
        device,
    )?))
}

fn build_affine_tril<B: Backend>(
    dim: usize,
    context_dim: usize,
    args: &TransformArgs,
    _rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Result<FlowTransform<B>> {
    Ok(FlowTransform::AffineTril(AffineTril::new(
        dim,
        context_dim,
        args.kwarg_floats("loc")?,
        args.kwarg_floats("scale_tril")?,
        device,
    )?))
}

/// Builds a complete flow for an event shape.
pub type FlowBuilderFn<B> = fn(
    event_shape: &EventShape,
    link: LinkTransform,
    options: &FlowOptions,
    transforms: &TransformRegistry<B>,
    device: &<B as Backend>::Device,
) -> Result<Flow<B>>;

pub struct FlowBuilderRegistry<B: Backend> {
    builders: BTreeMap<String, FlowBuilderFn<B>>,
}

impl<B: Backend> Default for FlowBuilderRegistry<B> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<B: Backend> FlowBuilderRegistry<B> {
    pub fn empty() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// `maf`, `nsf`, `mcf`, `scf`, `gaussian`, `gaussian_diag`.
    pub fn with_defaults() -> Self {
        let mut r = Self::empty();
        let builtins: [(&str, FlowBuilderFn<B>); 6] = [
            ("maf", masked_autoregressive_flow::<B>),
            ("nsf", neural_spline_flow::<B>),
            ("mcf", masked_coupling_flow::<B>),
            ("scf", spline_coupling_flow::<B>),
            ("gaussian", multivariate_gaussian::<B>),
            ("gaussian_diag", diagonal_gaussian::<B>),
        ];
        for (name, f) in builtins {
            r.builders.insert(name.to_string(), f);
        }
        r
    }

    pub fn register(&mut self, name: &str, builder: FlowBuilderFn<B>) -> Result<()> {
        let key = name.to_lowercase();
        if self.builders.contains_key(&key) {
            return Err(Error::Config(format!("flow builder `{key}` is already registered")));
        }
        self.builders.insert(key, builder);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }

    pub fn build(
        &self,
        name: &str,
        event_shape: &EventShape,
        link: LinkTransform,
        options: &FlowOptions,
        transforms: &TransformRegistry<B>,
        device: &B::Device,
    ) -> Result<Flow<B>> {
        let key = name.to_lowercase();
        let builder = self.builders.get(&key).ok_or_else(|| {
            Error::Config(format!(
                "unknown flow builder `{key}`; registered: {}",
                self.names().join(", ")
            ))
        })?;
        builder(event_shape, link, options, transforms, device)
    }
}

pub fn masked_autoregressive_flow<B: Backend>(
    event_shape: &EventShape,
    link: LinkTransform,
    options: &FlowOptions,
    transforms: &TransformRegistry<B>,
    device: &B::Device,
) -> Result<Flow<B>> {
    build_flow(event_shape, link, "affine_autoregressive", options, transforms, device)
}

pub fn neural_spline_flow<B: Backend>(
    event_shape: &EventShape,
    link: LinkTransform,
    options: &FlowOptions,
    transforms: &TransformRegistry<B>,
    device: &B::Device,
) -> Result<Flow<B>> {
    build_flow(event_shape, link, "spline_autoregressive", options, transforms, device)
}

pub fn masked_coupling_flow<B: Backend>(
    event_shape: &EventShape,
    link: LinkTransform,
    options: &FlowOptions,
    transforms: &TransformRegistry<B>,
    device: &B::Device,
) -> Result<Flow<B>> {
    build_flow(event_shape, link, "affine_coupling", options, transforms, device)
}

pub fn spline_coupling_flow<B: Backend>(
    event_shape: &EventShape,
    link: LinkTransform,
    options: &FlowOptions,
    transforms: &TransformRegistry<B>,
    device: &B::Device,
) -> Result<Flow<B>> {
    build_flow(event_shape, link, "spline_coupling", options, transforms, device)
}

/// Single-layer options for the Gaussian builders: one layer, standard normal base.
fn gaussian_options(options: &FlowOptions) -> FlowOptions {
    FlowOptions {
        num_flows: 1,
        permute: false,
        batch_norm: false,
        base: None,
        ..options.clone()
    }
}

pub fn multivariate_gaussian<B: Backend>(
    event_shape: &EventShape,
    link: LinkTransform,
    options: &FlowOptions,
    transforms: &TransformRegistry<B>,
    device: &B::Device,
) -> Result<Flow<B>> {
    build_flow(event_shape, link, "affine_tril", &gaussian_options(options), transforms, device)
}

pub fn diagonal_gaussian<B: Backend>(
    event_shape: &EventShape,
    link: LinkTransform,
    options: &FlowOptions,
    transforms: &TransformRegistry<B>,
    device: &B::Device,
) -> Result<Flow<B>> {
    build_flow(event_shape, link, "affine_diag", &gaussian_options(options), transforms, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn defaults_scale_with_dimension() {
        let r = TransformRegistry::<B>::with_defaults();
        let a = r.args_for("affine_autoregressive", 4, &Kwargs::new()).unwrap();
        assert_eq!(a.args, vec![ArgValue::Dims(vec![25])]);
        assert_eq!(a.kwargs["log_scale_min_clip"], ArgValue::Float(-3.0));

        let c = r.args_for("affine_coupling", 5, &Kwargs::new()).unwrap();
        assert_eq!(c.args, vec![ArgValue::Int(2), ArgValue::Dims(vec![30, 30])]);

        let s = r.args_for("spline_autoregressive", 3, &Kwargs::new()).unwrap();
        assert_eq!(s.kwargs["count_bins"], ArgValue::Int(10));
        assert_eq!(s.kwargs["bound"], ArgValue::Float(5.0));
    }

    #[test]
    fn caller_overrides_win_and_unknown_keywords_are_ignored() {
        let r = TransformRegistry::<B>::with_defaults();
        let mut o = Kwargs::new();
        o.insert("count_bins".into(), ArgValue::Int(4));
        o.insert("hidden_dims".into(), ArgValue::Dims(vec![7]));
        o.insert("log_scale_min_clip".into(), ArgValue::Float(-1.0));
        let s = r.args_for("spline_autoregressive", 3, &o).unwrap();
        assert_eq!(s.kwargs["count_bins"], ArgValue::Int(4));
        assert_eq!(s.args[1], ArgValue::Dims(vec![7]));
        assert!(!s.kwargs.contains_key("log_scale_min_clip"));
    }

    #[test]
    fn coupling_init_rejects_one_dimension() {
        let r = TransformRegistry::<B>::with_defaults();
        assert!(r.args_for("affine_coupling", 1, &Kwargs::new()).is_err());
        assert!(r.args_for("spline_coupling", 1, &Kwargs::new()).is_err());
    }

    #[test]
    fn lookup_is_case_insensitive_and_duplicates_fail() {
        let mut r = TransformRegistry::<B>::with_defaults();
        assert!(r.contains("Affine_Diag"));
        let dup = TransformEntry {
            ctor: build_affine_diag::<B>,
            init: init_affine_diag,
            keywords: &[],
        };
        assert!(matches!(r.register("AFFINE_DIAG", dup), Err(Error::Config(_))));

        let mut f = FlowBuilderRegistry::<B>::with_defaults();
        assert_eq!(f.names(), vec!["gaussian", "gaussian_diag", "maf", "mcf", "nsf", "scf"]);
        assert!(f.register("maf", masked_autoregressive_flow::<B>).is_err());
    }

    #[test]
    fn spline_order_defaults_to_linear_and_rejects_unknown_orders() {
        let device = Default::default();
        let r = TransformRegistry::<B>::with_defaults();
        let s = r.args_for("spline_coupling", 3, &Kwargs::new()).unwrap();
        assert_eq!(s.kwargs["order"], ArgValue::from("linear"));

        let mut rng = <ChaCha8Rng as rand::SeedableRng>::seed_from_u64(0);
        for order in ["linear", "quadratic"] {
            let mut o = Kwargs::new();
            o.insert("order".into(), ArgValue::from(order));
            assert!(r.build("spline_autoregressive", 2, 0, &o, &mut rng, &device).is_ok());
        }
        let mut o = Kwargs::new();
        o.insert("order".into(), ArgValue::from("cubic"));
        assert!(matches!(
            r.build("spline_autoregressive", 2, 0, &o, &mut rng, &device),
            Err(Error::Config(_))
        ));
    }
}
