use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};

use super::state::{State, StateIndex};
use crate::collective::ShardContext;
use crate::tree::{FromTree, Record, Tree};
use crate::{Error, Tensor};

/// How running statistics are kept.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchNormMode {
    /// Exponential moving average, seeded with the first batch. Training normalizes with the
    /// running statistics.
    #[default]
    Ema,
    /// Zero-debiased average of batch statistics. Training normalizes with the batch
    /// statistics.
    Batch,
}

/// Configuration to create a [BatchNorm](BatchNorm) layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNormConfig {
    /// The number of channels, the size of the leading input dimension.
    pub input_size: usize,
    /// The mapped axes statistics are averaged over.
    pub axis_names: Vec<String>,
    /// How running statistics are kept. Default: ema
    #[serde(default)]
    pub mode: BatchNormMode,
    /// A value required for numerical stability. Default: 1e-5
    #[serde(default = "default_eps")]
    pub eps: f32,
    /// Whether to learn a per-channel scale and shift. Default: true
    #[serde(default = "default_channelwise_affine")]
    pub channelwise_affine: bool,
    /// Weight of the previous running statistics in each update. Default: 0.99
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    /// Normalize with the running statistics instead of the batch. Default: false
    #[serde(default)]
    pub inference: bool,
}

fn default_eps() -> f32 {
    1e-5
}

fn default_channelwise_affine() -> bool {
    true
}

fn default_momentum() -> f32 {
    0.99
}

impl BatchNormConfig {
    /// A config over `input_size` channels averaging over `axis_names`, with defaults elsewhere.
    pub fn new<I, S>(input_size: usize, axis_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            input_size,
            axis_names: axis_names.into_iter().map(Into::into).collect(),
            mode: BatchNormMode::default(),
            eps: default_eps(),
            channelwise_affine: default_channelwise_affine(),
            momentum: default_momentum(),
            inference: false,
        }
    }

    /// Sets [`mode`](Self::mode).
    pub fn with_mode(mut self, mode: BatchNormMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets [`eps`](Self::eps).
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Sets [`channelwise_affine`](Self::channelwise_affine).
    pub fn with_channelwise_affine(mut self, channelwise_affine: bool) -> Self {
        self.channelwise_affine = channelwise_affine;
        self
    }

    /// Sets [`momentum`](Self::momentum).
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// Sets [`inference`](Self::inference).
    pub fn with_inference(mut self, inference: bool) -> Self {
        self.inference = inference;
        self
    }

    /// Initializes a layer and the state holding its running statistics.
    pub fn init(&self) -> Result<(BatchNorm, State), Error> {
        if self.input_size == 0 {
            return Err(Error::InvalidConfig {
                reason: "batch norm input_size must be non-zero".to_string(),
            });
        }
        if self.axis_names.is_empty() {
            return Err(Error::InvalidConfig {
                reason: "batch norm needs at least one axis name".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.momentum) {
            let momentum = self.momentum;
            return Err(Error::InvalidConfig {
                reason: format!("batch norm momentum must be in [0, 1), got {momentum}"),
            });
        }

        let size = self.input_size;
        let (stats, state) = match self.mode {
            BatchNormMode::Ema => {
                let first_time = StateIndex::new(true);
                let stats = StateIndex::new((zeros(size), ones(size)));
                let state = State::new().with_index(&first_time).with_index(&stats);
                (RunningStats::Ema { first_time, stats }, state)
            }
            BatchNormMode::Batch => {
                let counter = StateIndex::new(0u32);
                let hidden = (zeros(size), ones(size));
                let stats = StateIndex::new((hidden.clone(), hidden));
                let state = State::new().with_index(&counter).with_index(&stats);
                let stats = Box::new(stats);
                (RunningStats::Batch { counter, stats }, state)
            }
        };

        let (weight, bias) = match self.channelwise_affine {
            true => (Some(ones(size)), Some(zeros(size))),
            false => (None, None),
        };

        let norm = BatchNorm {
            weight,
            bias,
            stats,
            axis_names: self.axis_names.clone(),
            inference: self.inference,
            input_size: size,
            eps: self.eps,
            momentum: self.momentum,
        };
        Ok((norm, state))
    }
}

fn zeros(size: usize) -> Tensor {
    Tensor::zeros(vec![size])
}

fn ones(size: usize) -> Tensor {
    Tensor::ones(vec![size])
}

/// State indices of the running statistics, per mode.
#[derive(Clone, Debug)]
enum RunningStats {
    Ema {
        first_time: StateIndex<bool>,
        stats: StateIndex<(Tensor, Tensor)>,
    },
    Batch {
        counter: StateIndex<u32>,
        /// `((hidden_mean, hidden_var), (running_mean, running_var))`
        stats: Box<StateIndex<((Tensor, Tensor), (Tensor, Tensor))>>,
    },
}

/// Batch normalization over mapped axes.
///
/// Statistics are computed per channel (the leading dimension) and averaged over every
/// instance along `axis_names`, so the layer must run inside a shard map over those axes.
#[derive(Clone, Debug)]
pub struct BatchNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    stats: RunningStats,
    axis_names: Vec<String>,
    inference: bool,
    input_size: usize,
    eps: f32,
    momentum: f32,
}

impl BatchNorm {
    /// Normalizes `x` of shape `[input_size, ...]`, returning the output and the updated state.
    ///
    /// `inference` overrides the layer's own setting when given.
    pub fn forward(
        &self,
        ctx: &ShardContext<'_>,
        x: &Tensor,
        state: State,
        inference: Option<bool>,
    ) -> Result<(Tensor, State), Error> {
        if x.shape().first() != Some(&self.input_size) {
            return Err(Error::ShapeMismatch {
                expected: vec![self.input_size],
                got: x.shape().to_vec(),
            });
        }
        let inference = inference.unwrap_or(self.inference);

        let (mean, var, state) = match &self.stats {
            RunningStats::Ema { stats, .. } if inference => {
                let (mean, var) = state.get(stats)?;
                (mean, var, state)
            }
            RunningStats::Ema { first_time, stats } => {
                let first = state.get(first_time)?;
                let state = state.set(first_time, false);
                let (batch_mean, batch_var) = self.batch_stats(ctx, x)?;
                let (running_mean, running_var) = match first {
                    true => (batch_mean, batch_var),
                    false => {
                        let (running_mean, running_var) = state.get(stats)?;
                        (
                            self.decay(&running_mean, &batch_mean),
                            self.decay(&running_var, &batch_var),
                        )
                    }
                };
                let state = state.set(stats, (running_mean.clone(), running_var.clone()));
                (running_mean, running_var, state)
            }
            RunningStats::Batch { stats, .. } if inference => {
                let (_, (mean, var)) = state.get(&**stats)?;
                (mean, var, state)
            }
            RunningStats::Batch { counter, stats } => {
                let (batch_mean, batch_var) = self.batch_stats(ctx, x)?;
                let count = state.get(counter)? + 1;
                let ((hidden_mean, hidden_var), _) = state.get(&**stats)?;

                let hidden_mean = self.decay(&hidden_mean, &batch_mean);
                let hidden_var = self.decay(&hidden_var, &batch_var);
                // Zero-debiasing without warmup.
                let debias = 1.0 - self.momentum.powf(count as f32);
                let running_mean = &hidden_mean / debias;
                let running_var = &hidden_var / debias;

                let hidden = (hidden_mean, hidden_var);
                let running = (running_mean, running_var);
                let state = state.set(counter, count).set(&**stats, (hidden, running));
                (batch_mean, batch_var, state)
            }
        };

        Ok((self.normalize(x, &mean, &var)?, state))
    }

    /// The running mean and variance stored in `state`.
    pub fn running_stats(&self, state: &State) -> Result<(Tensor, Tensor), Error> {
        match &self.stats {
            RunningStats::Ema { stats, .. } => state.get(stats),
            RunningStats::Batch { stats, .. } => {
                state.get(&**stats).map(|(_, running)| running)
            }
        }
    }

    /// Per-channel scale, if the layer is affine.
    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    /// Per-channel shift, if the layer is affine.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// The mapped axes statistics are averaged over.
    pub fn axis_names(&self) -> &[String] {
        &self.axis_names
    }

    /// Number of channels.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// How running statistics are kept.
    pub fn mode(&self) -> BatchNormMode {
        match self.stats {
            RunningStats::Ema { .. } => BatchNormMode::Ema,
            RunningStats::Batch { .. } => BatchNormMode::Batch,
        }
    }

    /// `momentum * previous + (1 - momentum) * current`
    fn decay(&self, previous: &Tensor, current: &Tensor) -> Tensor {
        previous * self.momentum + current * (1.0 - self.momentum)
    }

    /// Per-channel mean and variance over the local block, averaged across `axis_names`.
    fn batch_stats(
        &self,
        ctx: &ShardContext<'_>,
        x: &Tensor,
    ) -> Result<(Tensor, Tensor), Error> {
        let local_mean = Array1::from_iter(
            x.axis_iter(Axis(0))
                .map(|channel| channel.mean().unwrap_or(0.0)),
        )
        .into_dyn();
        let mean = ctx.pmean(&local_mean, self.axis_names.as_slice())?;

        let local_var = Array1::from_iter(x.axis_iter(Axis(0)).zip(mean.iter()).map(
            |(channel, &mean)| {
                channel
                    .mapv(|value| (value - mean) * (value - mean))
                    .mean()
                    .unwrap_or(0.0)
            },
        ))
        .into_dyn();
        let var = ctx
            .pmean(&local_var, self.axis_names.as_slice())?
            .mapv(|value| value.max(0.0));

        Ok((mean, var))
    }

    /// Every per-channel operand must have shape `[input_size]`, as must the leading
    /// dimension of `x`.
    fn normalize(&self, x: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor, Error> {
        let size = self.input_size;
        let channel = |param: Option<&Tensor>, default: f32| -> Result<Vec<f32>, Error> {
            match param {
                Some(param) => {
                    check_channels(param, size)?;
                    Ok(param.iter().copied().collect())
                }
                None => Ok(vec![default; size]),
            }
        };
        let weight = channel(self.weight.as_ref(), 1.0)?;
        let bias = channel(self.bias.as_ref(), 0.0)?;
        let mean = channel(Some(mean), 0.0)?;
        let var = channel(Some(var), 1.0)?;

        let mut output = x.clone();
        let channels = output.axis_iter_mut(Axis(0));
        let params = weight.into_iter().zip(bias);
        let stats = mean.into_iter().zip(var);
        for ((mut values, (weight, bias)), (mean, var)) in channels.zip(params).zip(stats) {
            let scale = weight / (var + self.eps).sqrt();
            values.mapv_inplace(|value| (value - mean) * scale + bias);
        }
        Ok(output)
    }
}

fn check_channels(param: &Tensor, size: usize) -> Result<(), Error> {
    if param.shape() != [size] {
        return Err(Error::ShapeMismatch {
            expected: vec![size],
            got: param.shape().to_vec(),
        });
    }
    Ok(())
}

impl From<BatchNorm> for Tree {
    fn from(norm: BatchNorm) -> Self {
        Record::new("BatchNorm")
            .with_field("weight", norm.weight)
            .with_field("bias", norm.bias)
            .with_field("stats", Tree::opaque(norm.stats))
            .with_field("axis_names", norm.axis_names)
            .with_field("inference", norm.inference)
            .with_field("input_size", norm.input_size as i64)
            .with_field("eps", f64::from(norm.eps))
            .with_field("momentum", f64::from(norm.momentum))
            .into()
    }
}

impl FromTree for BatchNorm {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        let mut record = match tree {
            Tree::Record(record) if record.name() == "BatchNorm" => record,
            other => {
                return Err(Error::UnexpectedTree {
                    expected: "BatchNorm record".to_string(),
                    found: other.kind().to_string(),
                });
            }
        };
        let mut field = |name: &str| {
            record.take_field(name).ok_or_else(|| Error::UnexpectedTree {
                expected: format!("BatchNorm field '{name}'"),
                found: "nothing".to_string(),
            })
        };

        let weight: Option<Tensor> = field("weight")?.into_typed()?;
        let bias: Option<Tensor> = field("bias")?.into_typed()?;
        let stats = field("stats")?.opaque_value::<RunningStats>()?;
        let axis_names = field("axis_names")?.into_typed()?;
        let inference = field("inference")?.into_typed()?;
        let input_size = field("input_size")?.into_typed::<i64>()?;
        let input_size = usize::try_from(input_size).map_err(|_| Error::InvalidConfig {
            reason: format!("batch norm input_size {input_size} is negative"),
        })?;
        let eps = field("eps")?.into_typed::<f64>()? as f32;
        let momentum = field("momentum")?.into_typed::<f64>()? as f32;

        for param in weight.iter().chain(bias.iter()) {
            check_channels(param, input_size)?;
        }

        Ok(Self {
            weight,
            bias,
            stats,
            axis_names,
            inference,
            input_size,
            eps,
            momentum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::Rendezvous;
    use crate::sharding::{DeviceMesh, ManualGrid};
    use ndarray::arr2;
    use rstest::rstest;

    fn assert_close(actual: &Tensor, expected: &[f32]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-4, "{actual:?} != {expected:?}");
        }
    }

    /// Runs `f` as the only instance of a one-element `batch` axis.
    fn single<R>(f: impl FnOnce(&ShardContext<'_>) -> R) -> R {
        let mesh = DeviceMesh::make([1], ["batch"]).unwrap();
        let grid = ManualGrid::new(&mesh, &[]).unwrap();
        let rendezvous = Rendezvous::new(1);
        f(&ShardContext::new(0, &grid, &rendezvous))
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{"input_size": 3, "axis_names": ["batch"], "mode": "batch"}"#;
        let config: BatchNormConfig = serde_json::from_str(json).unwrap();

        assert_eq!(
            config,
            BatchNormConfig::new(3, ["batch"]).with_mode(BatchNormMode::Batch)
        );
        assert_eq!(config.eps, 1e-5);
        assert_eq!(config.momentum, 0.99);
        assert!(config.channelwise_affine);
    }

    #[rstest]
    #[case::no_axes(BatchNormConfig::new(2, Vec::<String>::new()))]
    #[case::no_channels(BatchNormConfig::new(0, ["batch"]))]
    #[case::momentum_of_one(BatchNormConfig::new(2, ["batch"]).with_momentum(1.0))]
    fn invalid_configs_are_rejected(#[case] config: BatchNormConfig) {
        assert!(matches!(config.init(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn ema_seeds_with_the_first_batch_then_decays() {
        let (norm, state) = BatchNormConfig::new(1, ["batch"])
            .with_momentum(0.5)
            .init()
            .unwrap();
        let first = arr2(&[[1.0f32, 3.0]]).into_dyn();
        let second = arr2(&[[3.0f32, 5.0]]).into_dyn();

        let (output, state) = single(|ctx| norm.forward(ctx, &first, state, None)).unwrap();
        assert_close(&output, &[-1.0, 1.0]);
        let (mean, var) = norm.running_stats(&state).unwrap();
        assert_close(&mean, &[2.0]);
        assert_close(&var, &[1.0]);

        let (_, state) = single(|ctx| norm.forward(ctx, &second, state, None)).unwrap();
        let (mean, var) = norm.running_stats(&state).unwrap();
        assert_close(&mean, &[3.0]);
        assert_close(&var, &[1.0]);
    }

    #[test]
    fn batch_mode_debiases_without_warmup() {
        let (norm, state) = BatchNormConfig::new(1, ["batch"])
            .with_mode(BatchNormMode::Batch)
            .with_momentum(0.5)
            .init()
            .unwrap();
        let x = arr2(&[[1.0f32, 3.0]]).into_dyn();

        let (output, state) = single(|ctx| norm.forward(ctx, &x, state, None)).unwrap();
        assert_close(&output, &[-1.0, 1.0]);
        // hidden = (0.5 * 0 + 0.5 * 2, 0.5 * 1 + 0.5 * 1), divided by 1 - 0.5^1
        let (mean, var) = norm.running_stats(&state).unwrap();
        assert_close(&mean, &[2.0]);
        assert_close(&var, &[2.0]);

        let (output, _) = single(|ctx| norm.forward(ctx, &x, state, Some(true))).unwrap();
        let scale = 1.0 / (2.0f32 + 1e-5).sqrt();
        assert_close(&output, &[-scale, scale]);
    }

    #[test]
    fn inference_leaves_the_state_alone() {
        let (norm, state) = BatchNormConfig::new(2, ["batch"])
            .with_inference(true)
            .with_eps(1e-3)
            .init()
            .unwrap();
        let x = arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn();

        let (output, after) = single(|ctx| norm.forward(ctx, &x, state.clone(), None)).unwrap();

        assert_eq!(norm.running_stats(&after), norm.running_stats(&state));
        let scale = 1.0 / (1.0f32 + 1e-3).sqrt();
        assert_close(&output, &[1.0, 2.0, 3.0, 4.0].map(|v: f32| v * scale));
    }

    #[test]
    fn channel_count_is_checked() {
        let (norm, state) = BatchNormConfig::new(3, ["batch"]).init().unwrap();
        let x = arr2(&[[1.0f32, 2.0]]).into_dyn();

        let result = single(|ctx| norm.forward(ctx, &x, state, None));

        assert_eq!(
            result.map(|(output, _)| output),
            Err(Error::ShapeMismatch {
                expected: vec![3],
                got: vec![1, 2]
            })
        );
    }

    #[test]
    fn parameters_must_cover_every_channel() {
        let (norm, state) = BatchNormConfig::new(2, ["batch"]).init().unwrap();
        let norm = BatchNorm {
            bias: Some(zeros(3)),
            ..norm
        };
        let x = arr2(&[[1.0f32], [2.0]]).into_dyn();

        let result = single(|ctx| norm.forward(ctx, &x, state, Some(true)));

        assert_eq!(
            result.map(|(output, _)| output),
            Err(Error::ShapeMismatch {
                expected: vec![2],
                got: vec![3]
            })
        );
    }

    #[test]
    fn trees_with_short_parameters_are_rejected() {
        let (norm, _) = BatchNormConfig::new(2, ["batch"]).init().unwrap();
        let Tree::Record(mut record) = Tree::from(norm) else {
            panic!("BatchNorm converts to a record");
        };
        record.take_field("weight");
        let tree = Tree::from(record.with_field("weight", ones(1)));

        assert_eq!(
            BatchNorm::from_tree(tree).err(),
            Some(Error::ShapeMismatch {
                expected: vec![2],
                got: vec![1]
            })
        );
    }

    #[test]
    fn layers_round_trip_through_trees() {
        let (norm, _) = BatchNormConfig::new(2, ["batch"])
            .with_channelwise_affine(false)
            .init()
            .unwrap();

        let restored: BatchNorm = Tree::from(norm.clone()).into_typed().unwrap();

        assert_eq!(restored.weight(), None);
        assert_eq!(restored.axis_names(), norm.axis_names());
        assert_eq!(restored.input_size(), 2);
        assert_eq!(restored.mode(), BatchNormMode::Ema);
    }
}
