//! WMT German-English translation with a sequence-to-sequence transformer.
//!
//! Each sample row holds `max_tokens` source token ids followed by
//! `max_tokens` target token ids, both right-padded with [`PAD_IDX`]. The
//! transformer body trains at a tenth of the submission's learning rate.

use crate::ops::{self, matrix, vector};
use ndarray::{Array2, Axis, s};
use optibench_core::{
    Batch, BenchError, BenchResult, BoundModel, DataModule, Dataset, DatasetSource, Evaluation, GroupedModule,
    LR_MULTIPLIER, MetricMode, Module, Network, NetworkBuilder, Overrides, ParamMatcher, Partition, RuntimeArgs,
    RuntimeSpecs, Split, Submission, WorkloadConfig, WorkloadFactory, WorkloadModel, WorkloadPair, merge_partitions,
    override_partition,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const NAME: &str = "wmt";

pub const UNK_IDX: usize = 0;
pub const PAD_IDX: usize = 1;
pub const BOS_IDX: usize = 2;
pub const EOS_IDX: usize = 3;
const SPECIAL_TOKENS: usize = 4;

/// Learning-rate multiplier of every trainable parameter of the translation model.
pub const BODY_LR_MULTIPLIER: f64 = 0.1;
const LABEL_SMOOTHING: f64 = 0.1;
const EPOCHS: u32 = 18;
const BATCH_SIZE: usize = 128;
const DEVICES: u32 = 4;
const MODEL: &str = "model";

/// WMT14 de-en train pairs, newstest2013 for validation, newstest2014 for test.
const SPLITS: [usize; 4] = [4_508_785, 3_000, 3_003, 3_003];

/// The `model` option table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub num_encoder_layers: usize,
    pub num_decoder_layers: usize,
    pub emb_size: usize,
    pub nhead: usize,
    pub dim_feedforward: usize,
    pub src_vocab_size: usize,
    pub tgt_vocab_size: usize,
    /// Longest sentence in tokens, including BOS and EOS.
    pub max_tokens: usize,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            num_encoder_layers: 3,
            num_decoder_layers: 3,
            emb_size: 256,
            nhead: 8,
            dim_feedforward: 1024,
            src_vocab_size: 8192,
            tgt_vocab_size: 8192,
            max_tokens: 64,
        }
    }
}

impl ModelOptions {
    fn validate(&self) -> BenchResult<()> {
        if self.nhead == 0 || self.emb_size == 0 || self.emb_size % self.nhead != 0 {
            return Err(BenchError::Config(format!(
                "emb_size ({}) must be a positive multiple of nhead ({})",
                self.emb_size, self.nhead
            )));
        }
        if self.src_vocab_size <= SPECIAL_TOKENS || self.tgt_vocab_size <= SPECIAL_TOKENS {
            return Err(BenchError::Config(format!("vocabularies must hold more than {SPECIAL_TOKENS} special tokens")));
        }
        if self.max_tokens < 3 {
            return Err(BenchError::Config("max_tokens must be >= 3".to_string()));
        }
        Ok(())
    }
}

fn attention_params(builder: NetworkBuilder, prefix: &str, emb: usize) -> NetworkBuilder {
    builder
        .tensor(format!("{prefix}.in_proj_weight"), &[3 * emb, emb])
        .tensor(format!("{prefix}.in_proj_bias"), &[3 * emb])
        .linear(&format!("{prefix}.out_proj"), emb, emb, true)
}

fn feed_forward_params(builder: NetworkBuilder, prefix: &str, emb: usize, ff: usize) -> NetworkBuilder {
    builder.linear(&format!("{prefix}.linear1"), emb, ff, true).linear(&format!("{prefix}.linear2"), ff, emb, true)
}

/// Sinusoidal position table of shape `[max_tokens, emb]`.
pub fn positional_encoding(max_tokens: usize, emb: usize) -> Array2<f32> {
    Array2::from_shape_fn((max_tokens, emb), |(pos, i)| {
        let den = (-((i - i % 2) as f32) * 10_000_f32.ln() / emb as f32).exp();
        let angle = pos as f32 * den;
        if i % 2 == 0 { angle.sin() } else { angle.cos() }
    })
}

/// Parameter layout of a post-norm encoder-decoder transformer with a
/// generator head and scaled token embeddings.
pub fn network(options: &ModelOptions, seed: u64) -> BenchResult<Network> {
    options.validate()?;
    let emb = options.emb_size;
    let ff = options.dim_feedforward;
    let mut builder = Network::builder("seq2seq_transformer").seed(seed);
    for i in 0..options.num_encoder_layers {
        let prefix = format!("transformer.encoder.layers.{i}");
        builder = attention_params(builder, &format!("{prefix}.self_attn"), emb);
        builder = feed_forward_params(builder, &prefix, emb, ff)
            .layer_norm(&format!("{prefix}.norm1"), emb)
            .layer_norm(&format!("{prefix}.norm2"), emb);
    }
    builder = builder.layer_norm("transformer.encoder.norm", emb);
    for i in 0..options.num_decoder_layers {
        let prefix = format!("transformer.decoder.layers.{i}");
        builder = attention_params(builder, &format!("{prefix}.self_attn"), emb);
        builder = attention_params(builder, &format!("{prefix}.multihead_attn"), emb);
        builder = feed_forward_params(builder, &prefix, emb, ff)
            .layer_norm(&format!("{prefix}.norm1"), emb)
            .layer_norm(&format!("{prefix}.norm2"), emb)
            .layer_norm(&format!("{prefix}.norm3"), emb);
    }
    builder
        .layer_norm("transformer.decoder.norm", emb)
        .linear("generator", emb, options.tgt_vocab_size, true)
        .embedding("src_tok_emb.embedding", options.src_vocab_size, emb)
        .embedding("tgt_tok_emb.embedding", options.tgt_vocab_size, emb)
        .buffer("positional_encoding.pos_embedding", positional_encoding(options.max_tokens, emb).into_dyn())
        .build()
}

/// The translation model with its whole parameter set slowed down relative
/// to the submission's base learning rate.
#[derive(Debug)]
pub struct GroupedTransformer {
    network: Network,
}

impl GroupedTransformer {
    pub fn new(network: Network) -> BenchResult<Self> {
        if network.trainable_parameters().is_empty() {
            return Err(BenchError::InvalidModel { model: network.name().to_string() });
        }
        Ok(Self { network })
    }
}

impl GroupedModule for GroupedTransformer {
    fn module(&self) -> &dyn Module {
        &self.network
    }

    fn parameter_groups(&self) -> BenchResult<Partition> {
        let params = self.trainable_parameters();
        let base = Partition::identity(params.clone());
        let body = override_partition(
            &params,
            &ParamMatcher::All,
            Overrides::new().with(LR_MULTIPLIER, BODY_LR_MULTIPLIER),
        )?;
        merge_partitions(&[base, body])
    }
}

/// Token ids of one padded half-row, with trailing padding removed.
fn tokens(row: ndarray::ArrayView1<'_, f32>) -> Vec<usize> {
    let mut ids: Vec<usize> = row.iter().map(|&v| v.round() as usize).collect();
    let end = ids.iter().rposition(|&t| t != PAD_IDX).map_or(0, |i| i + 1);
    ids.truncate(end);
    ids
}

#[derive(Debug)]
pub struct WmtModel {
    network: Network,
    options: ModelOptions,
    bound: BoundModel,
    specs: RuntimeSpecs,
}

impl WmtModel {
    pub fn new(options: ModelOptions, submission: Arc<dyn Submission>, specs: RuntimeSpecs, seed: u64) -> BenchResult<Self> {
        let network = network(&options, seed)?;
        let bound = BoundModel::from_grouped(GroupedTransformer::new(network.clone())?, submission);
        Ok(Self { network, options, bound, specs })
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    fn embed(&self, prefix: &str, ids: &[usize]) -> BenchResult<Array2<f32>> {
        let emb = ops::embedding(&self.network, &format!("{prefix}.embedding"), ids)? * (self.options.emb_size as f32).sqrt();
        let table = self.network.param("positional_encoding.pos_embedding")?.read();
        let positions = matrix(&table)?;
        if ids.len() > positions.nrows() {
            return Err(BenchError::Config(format!(
                "sentence of {} tokens exceeds max_tokens {}",
                ids.len(),
                positions.nrows()
            )));
        }
        Ok(emb + &positions.slice(s![..ids.len(), ..]))
    }

    /// Multi-head attention of `query` over `memory`.
    fn attention(&self, prefix: &str, query: &Array2<f32>, memory: &Array2<f32>, causal: bool) -> BenchResult<Array2<f32>> {
        let weight = self.network.param(&format!("{prefix}.in_proj_weight"))?.read();
        let bias = self.network.param(&format!("{prefix}.in_proj_bias"))?.read();
        let (w, b) = (matrix(&weight)?, vector(&bias)?);
        let e = self.options.emb_size;
        let project = |x: &Array2<f32>, part: usize| {
            x.dot(&w.slice(s![part * e..(part + 1) * e, ..]).t()) + &b.slice(s![part * e..(part + 1) * e])
        };
        let (q, k, v) = (project(query, 0), project(memory, 1), project(memory, 2));

        let head_dim = e / self.options.nhead;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut out = Array2::zeros((query.nrows(), e));
        for h in 0..self.options.nhead {
            let cols = h * head_dim..(h + 1) * head_dim;
            let mut scores = q.slice(s![.., cols.clone()]).dot(&k.slice(s![.., cols.clone()]).t()) * scale;
            if causal {
                scores.indexed_iter_mut().filter(|((i, j), _)| j > i).for_each(|(_, v)| *v = f32::NEG_INFINITY);
            }
            let weights = ops::log_softmax(&scores).mapv_into(f32::exp);
            out.slice_mut(s![.., cols.clone()]).assign(&weights.dot(&v.slice(s![.., cols])));
        }
        ops::linear(&self.network, &format!("{prefix}.out_proj"), &out)
    }

    fn feed_forward(&self, prefix: &str, x: &Array2<f32>) -> BenchResult<Array2<f32>> {
        let hidden = ops::relu(ops::linear(&self.network, &format!("{prefix}.linear1"), x)?);
        ops::linear(&self.network, &format!("{prefix}.linear2"), &hidden)
    }

    pub fn encode(&self, src: &[usize]) -> BenchResult<Array2<f32>> {
        let net = &self.network;
        let mut x = self.embed("src_tok_emb", src)?;
        for i in 0..self.options.num_encoder_layers {
            let prefix = format!("transformer.encoder.layers.{i}");
            let attended = self.attention(&format!("{prefix}.self_attn"), &x, &x, false)?;
            x = ops::layer_norm(net, &format!("{prefix}.norm1"), &(x + &attended))?;
            let ff = self.feed_forward(&prefix, &x)?;
            x = ops::layer_norm(net, &format!("{prefix}.norm2"), &(x + &ff))?;
        }
        ops::layer_norm(net, "transformer.encoder.norm", &x)
    }

    pub fn decode(&self, tgt: &[usize], memory: &Array2<f32>) -> BenchResult<Array2<f32>> {
        let net = &self.network;
        let mut x = self.embed("tgt_tok_emb", tgt)?;
        for i in 0..self.options.num_decoder_layers {
            let prefix = format!("transformer.decoder.layers.{i}");
            let attended = self.attention(&format!("{prefix}.self_attn"), &x, &x, true)?;
            x = ops::layer_norm(net, &format!("{prefix}.norm1"), &(x + &attended))?;
            let crossed = self.attention(&format!("{prefix}.multihead_attn"), &x, memory, false)?;
            x = ops::layer_norm(net, &format!("{prefix}.norm2"), &(x + &crossed))?;
            let ff = self.feed_forward(&prefix, &x)?;
            x = ops::layer_norm(net, &format!("{prefix}.norm3"), &(x + &ff))?;
        }
        ops::layer_norm(net, "transformer.decoder.norm", &x)
    }

    /// Generator logits for every next-token position of `tgt`, conditioned on the gold prefix.
    pub fn forward(&self, src: &[usize], tgt: &[usize]) -> BenchResult<Array2<f32>> {
        let memory = self.encode(src)?;
        let decoded = self.decode(&tgt[..tgt.len().saturating_sub(1)], &memory)?;
        ops::linear(&self.network, "generator", &decoded)
    }
}

impl WorkloadModel for WmtModel {
    fn name(&self) -> &str {
        NAME
    }

    fn get_specs(&self) -> &RuntimeSpecs {
        &self.specs
    }

    fn bound(&self) -> &BoundModel {
        &self.bound
    }

    /// Label-smoothed cross-entropy over all non-padding target tokens.
    fn evaluate(&self, batch: &Batch) -> BenchResult<Evaluation> {
        let width = self.options.max_tokens;
        if batch.inputs.ncols() != 2 * width {
            return Err(BenchError::Config(format!(
                "expected rows of {} token ids, got {}",
                2 * width,
                batch.inputs.ncols()
            )));
        }
        let mut logits = Vec::with_capacity(batch.len());
        let mut targets = Vec::new();
        for row in batch.inputs.rows() {
            let src = tokens(row.slice(s![..width]));
            let tgt = tokens(row.slice(s![width..]));
            if src.is_empty() || tgt.len() < 2 {
                continue;
            }
            logits.push(self.forward(&src, &tgt)?);
            targets.extend_from_slice(&tgt[1..]);
        }
        if logits.is_empty() {
            return Ok(Evaluation { loss: 0.0, accuracy: None });
        }
        let views: Vec<_> = logits.iter().map(|l| l.view()).collect();
        let stacked = ndarray::concatenate(Axis(0), &views)?;
        Ok(Evaluation { loss: ops::cross_entropy(&stacked, &targets, Some(PAD_IDX), LABEL_SMOOTHING)?, accuracy: None })
    }
}

/// Sentence pairs read from split files, or random token sequences.
#[derive(Debug, Clone)]
pub struct WmtSource {
    options: ModelOptions,
}

impl WmtSource {
    pub fn new(options: ModelOptions) -> Self {
        Self { options }
    }

    fn sentence(&self, rng: &mut StdRng, vocab: usize) -> Vec<f32> {
        let width = self.options.max_tokens;
        let len = rng.gen_range(3..=width);
        let mut row = vec![PAD_IDX as f32; width];
        row[0] = BOS_IDX as f32;
        for slot in &mut row[1..len - 1] {
            *slot = rng.gen_range(SPECIAL_TOKENS..vocab) as f32;
        }
        row[len - 1] = EOS_IDX as f32;
        row
    }
}

impl DatasetSource for WmtSource {
    fn num_features(&self) -> usize {
        2 * self.options.max_tokens
    }

    fn num_classes(&self) -> usize {
        self.options.tgt_vocab_size
    }

    fn nominal_len(&self, split: Split) -> usize {
        SPLITS[split as usize]
    }

    /// Targets carry the target sentence length in tokens.
    fn synthesize(&self, split: Split, seed: u64) -> BenchResult<Dataset> {
        let rows = self.synthetic_len(split);
        let mut rng = StdRng::seed_from_u64(seed ^ (split as u64 + 1).wrapping_mul(0xA076_1D64_78BD_642F));
        let mut data = Vec::with_capacity(rows * self.num_features());
        let mut targets = Vec::with_capacity(rows);
        for _ in 0..rows {
            data.extend(self.sentence(&mut rng, self.options.src_vocab_size));
            let tgt = self.sentence(&mut rng, self.options.tgt_vocab_size);
            targets.push(tgt.iter().filter(|&&t| t != PAD_IDX as f32).count());
            data.extend(tgt);
        }
        Dataset::new(Array2::from_shape_vec((rows, self.num_features()), data)?, targets)
    }
}

/// `max_epochs` worth of steps for `train_len` pairs split across `devices`.
pub fn specs(train_len: usize, batch_size: usize, devices: u32) -> BenchResult<RuntimeSpecs> {
    if batch_size == 0 {
        return Err(BenchError::MisconfiguredData { workload: NAME.to_string(), field: "batch_size".to_string() });
    }
    let global_batch = batch_size.checked_mul(devices.max(1) as usize).ok_or_else(|| {
        BenchError::Config(format!("{NAME}: batch size {batch_size} across {devices} devices overflows"))
    })?;
    let per_epoch = train_len.div_ceil(global_batch) as u64;
    RuntimeSpecs::new(Some(EPOCHS), Some(per_epoch * u64::from(EPOCHS)), devices, "val_loss", MetricMode::Min)
}

pub struct WmtFactory;

impl WorkloadFactory for WmtFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "WMT14 de-en, encoder-decoder transformer trained at a tenth of the base lr"
    }

    fn default_config(&self) -> WorkloadConfig {
        WorkloadConfig::new(NAME, BATCH_SIZE)
    }

    fn get_workload(&self, submission: Arc<dyn Submission>, args: &RuntimeArgs) -> BenchResult<WorkloadPair> {
        let config = args.workload_config(self.default_config())?;
        let options: ModelOptions =
            if config.options.contains_key(MODEL) { config.option(MODEL)? } else { ModelOptions::default() };
        debug!(workload = NAME, ?options, "resolved model options");

        let source = WmtSource::new(options.clone());
        let specs = specs(source.nominal_len(Split::Train), config.batch_size, args.devices.unwrap_or(DEVICES))?;
        let model = WmtModel::new(options, submission, specs, args.seed)?;
        let data = DataModule::new(config, source).with_download(args.download).with_seed(args.seed);
        Ok((Box::new(model), Box::new(data)))
    }
}
