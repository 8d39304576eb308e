pub mod catalog;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod server;

pub use catalog::VarietyCatalog;
pub use config::AppConfig;
pub use error::ServiceError;
pub use evaluation::{EvaluationReport, LabeledSample};
pub use model::{InferenceMode, ModelRegistry, Prediction, Vocabulary};
pub use pipeline::{DispatchOutcome, InferenceService, Stage};
pub use server::build_router;
