pub mod controller;
pub mod dispatcher;
pub mod dom;
pub mod extractor;
pub mod heuristics;
pub mod history;
pub mod presenter;
pub mod remote;
pub mod stats;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use controller::{
    ControlMessage, ControllerState, Disposition, FilterDeps, FilterEvent, ItemOutcome, SlopFilter,
};
pub use dispatcher::{ClassifyError, ClassifyRequest, DispatchOutcome, RemoteClassifier};
pub use dom::{Document, DomNode, Mutation, NodeRef, Query};
pub use extractor::{Extraction, Extractor};
pub use heuristics::{ContentPolicy, HeuristicClassifier};
pub use history::HistoryStore;
pub use remote::LlmClassifier;
pub use stats::FilterStats;
pub use store::{FileStore, KeyValueStore, MemoryStore, Settings, StoreArea};
