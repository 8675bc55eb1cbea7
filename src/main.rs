use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::Context;
use log::info;
use ndarray::{Array1, Array2, Axis, Ix2};
use orchestra_ps::{
    Agent, BarrierAgent, Defaults, Model, ModelConfig, Module, PsErr, SparseBatch, StoreHandle,
    StrategyBuilder,
    model::{EmbeddingDecl, ModuleDecl, ModuleKind, Registry, TensorDecl},
};
use tokio::task::JoinSet;

const DEFAULT_RANKS: usize = 2;
const STEPS: usize = 20;
const BATCH_SIZE: u64 = 16;
const WIDTH: usize = 4;

const DEFAULT_CONFIG: &str = r#"{
    "experiment_name": "click_demo",
    "updater": {"adagrad": {"learning_rate": 0.1}},
    "initializer": {"normal": {"mean": 0.0, "variance": 0.01}},
    "seed": 42,
    "partition_count": 4
}"#;

/// A logistic regression over one user embedding.
struct ClickModel {
    training: bool,
}

impl Module for ClickModel {
    fn parameters(&self) -> Vec<TensorDecl> {
        vec![
            TensorDecl::new("fc.weight", &[1, WIDTH]),
            TensorDecl::new("fc.bias", &[1]),
        ]
    }

    fn modules(&self) -> Vec<ModuleDecl> {
        vec![ModuleDecl::new(
            "user_emb",
            ModuleKind::Embedding(EmbeddingDecl::new(WIDTH, "user")),
        )]
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn serialize(&self, meta: &str) -> orchestra_ps::Result<Vec<u8>> {
        Ok(format!("click_model\n{meta}").into_bytes())
    }
}

/// Runs the forward and backward passes, returning the mean log loss.
fn forward(registry: &mut Registry, labels: &Array1<f32>) -> orchestra_ps::Result<f32> {
    let unknown = |name: &str| PsErr::UnknownTensor {
        name: name.to_string(),
    };

    let emb = registry.get("user_emb").ok_or_else(|| unknown("user_emb"))?.embed()?;
    let weight = registry
        .get("fc.weight")
        .ok_or_else(|| unknown("fc.weight"))?
        .value()?
        .into_dimensionality::<Ix2>()?
        .to_owned();
    let bias = registry.get("fc.bias").ok_or_else(|| unknown("fc.bias"))?.value()?.sum();

    let logits = emb.dot(&weight.t()).column(0).mapv(|z| z + bias);
    let probs = logits.mapv(|z| 1. / (1. + (-z).exp()));
    let loss = probs
        .iter()
        .zip(labels)
        .map(|(&p, &y)| -(y * p.max(1e-7).ln() + (1. - y) * (1. - p).max(1e-7).ln()))
        .sum::<f32>()
        / labels.len() as f32;

    let n = labels.len() as f32;
    let delta: Array2<f32> = ((&probs - labels) / n).insert_axis(Axis(1));

    let grad_weight = delta.t().dot(&emb);
    let grad_bias = Array1::from_elem(1, delta.sum());
    let grad_emb = delta.dot(&weight);

    registry.tensor_mut("fc.weight")?.accumulate_grad(grad_weight.into_dyn().view())?;
    registry.tensor_mut("fc.bias")?.accumulate_grad(grad_bias.into_dyn().view())?;
    registry.tensor_mut("user_emb")?.accumulate_sparse_grad(grad_emb.view())?;

    Ok(loss)
}

/// The keys and labels of a synthetic batch, users with an even id always click.
fn synthetic_batch(rank: usize, step: usize) -> (SparseBatch, Array1<f32>) {
    let offset = (rank * STEPS + step) as u64 * 7;
    let keys: Vec<u64> = (0..BATCH_SIZE).map(|i| (offset + i * 3) % 64).collect();
    let labels = keys.iter().map(|k| (k % 2 == 0) as u8 as f32).collect();

    (SparseBatch::from([("user".to_string(), keys)]), labels)
}

async fn train<A: Agent>(
    agent: A,
    store: StoreHandle,
    defaults: Defaults,
    builder: StrategyBuilder,
    config: ModelConfig,
    output: PathBuf,
) -> anyhow::Result<()> {
    let rank = agent.rank();
    let mut model = Model::new(agent, ClickModel { training: true }, store, &defaults)?;
    builder.configure(&config, &mut model)?;

    model.initialize().await?;

    for step in 0..STEPS {
        let (batch, labels) = synthetic_batch(rank, step);
        let loss = model
            .call(&batch, move |_, registry| forward(registry, &labels))
            .await??;

        model.push(false, true).await?;
        model.zero_grad();

        if step % 5 == 0 {
            info!(rank = rank, step = step; "loss {loss:.4}");
        }
    }

    model.sync().await?;
    model.prune_old(STEPS as u64 * 4).await?;
    model.save(&output.join("checkpoint")).await?;

    model.eval();
    let path = model
        .export(&format!("{}/", output.display()))
        .await
        .context("exporting the trained model")?;

    if rank == 0 {
        info!("exported model to {}", path.display());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::var("ORCHESTRA_CONFIG") {
        Ok(path) => ModelConfig::load(Path::new(&path))
            .await
            .with_context(|| format!("reading config {path}"))?,
        Err(_) => ModelConfig::from_json(DEFAULT_CONFIG)?,
    };

    let ranks = match env::var("ORCHESTRA_RANKS") {
        Ok(ranks) => ranks.parse().context("parsing ORCHESTRA_RANKS")?,
        Err(_) => DEFAULT_RANKS,
    };

    let output = env::var("ORCHESTRA_OUTPUT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("orchestra-ps"));

    let builder = StrategyBuilder::new(config.seed);
    let defaults = builder.defaults(&config)?;
    let store = StoreHandle::in_memory();

    info!("training with {ranks} ranks, writing to {}", output.display());

    let mut tasks = JoinSet::new();
    for agent in BarrierAgent::group(ranks) {
        tasks.spawn(train(
            agent,
            store.clone(),
            defaults.clone(),
            builder.clone(),
            config.clone(),
            output.clone(),
        ));
    }

    while let Some(joined) = tasks.join_next().await {
        joined??;
    }

    Ok(())
}
