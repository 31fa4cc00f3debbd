use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use neurograde::EngineConfig;
use neurograde::estimator::ClassifierKind;

#[derive(Parser, Debug)]
#[command(
    name = "neurograde",
    version,
    about = "Incremental consensus labels for multi-annotator scan reviews"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Ingest(IngestArgs),
    Train(TrainArgs),
    Lookup(LookupArgs),
    Status(StatusArgs),
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ingest(_) => "ingest",
            Self::Train(_) => "train",
            Self::Lookup(_) => "lookup",
            Self::Status(_) => "status",
        }
    }

    pub fn store(&self) -> &StoreArgs {
        match self {
            Self::Ingest(args) => &args.store,
            Self::Train(args) => &args.store,
            Self::Lookup(args) => &args.store,
            Self::Status(args) => &args.store,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, default_value = ".cache/neurograde")]
    pub data_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub record_path: Option<PathBuf>,
}

impl StoreArgs {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("neurograde.sqlite"))
    }

    pub fn resolved_record_path(&self) -> PathBuf {
        self.record_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("consensus_labels.json"))
    }
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// JSON document: scan id -> annotator id -> field name -> raw value.
    #[arg(long)]
    pub batch: PathBuf,

    /// Write the batch summary here instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub force_retrain: bool,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// JSON document: field name -> { annotators, labels, features }.
    #[arg(long)]
    pub labels: PathBuf,

    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub force_retrain: bool,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    #[arg(long, default_value_t = 5)]
    pub folds: usize,

    #[arg(long, default_value_t = 0.1)]
    pub retrain_threshold: f64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 2)]
    pub feature_dim: usize,

    #[arg(long, value_enum, default_value_t = ClassifierArg::Logistic)]
    pub classifier: ClassifierArg,

    #[arg(long, default_value_t = 1000)]
    pub max_iter: usize,

    #[arg(long, default_value_t = 1.0)]
    pub l2_c: f64,
}

impl EngineArgs {
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            folds: self.folds,
            retrain_threshold: self.retrain_threshold,
            seed: self.seed,
            feature_dimensions: self.feature_dim,
            classifier: self.classifier.into(),
            max_iter: self.max_iter,
            l2_c: self.l2_c,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ClassifierArg {
    Logistic,
    NaiveBayes,
}

impl ClassifierArg {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logistic => "logistic",
            Self::NaiveBayes => "naive-bayes",
        }
    }
}

impl From<ClassifierArg> for ClassifierKind {
    fn from(value: ClassifierArg) -> Self {
        match value {
            ClassifierArg::Logistic => ClassifierKind::Logistic,
            ClassifierArg::NaiveBayes => ClassifierKind::NaiveBayes,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LookupArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub scan_id: String,

    /// Field name such as "Tumor Grade"; all fields when omitted.
    #[arg(long)]
    pub field: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, default_value_t = false)]
    pub history: bool,
}
