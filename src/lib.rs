#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{CacheError, CacheIoError, Result};

pub mod utils;

pub mod hasher;
pub use hasher::{HashAlgorithm, HashFactory};

pub mod archive;

pub mod exec;
pub use exec::{
    AttachedOutput, ModuleOutputs, ParamValue, ParameterIntrospection, PluginCoords, Step,
    StepIntrospector, StepRunner, StepSource,
};

pub mod lifecycle;
pub use lifecycle::{ForkTracker, LifecycleSegmenter, Lifecycles, StandardLifecycles};

pub mod config;
pub use config::{CacheConfig, PropertyOverrides};

pub mod model;
pub use model::{
    ArtifactDescriptor, BuildRecord, CacheContext, CacheResult, CompletedExecution, DigestItem,
    InputFingerprint, ModuleId, PropertyValue, RestorationStatus, ScmInfo,
    CACHE_IMPLEMENTATION_VERSION,
};

pub mod fingerprint;
pub use fingerprint::{
    DependencyInput, InputFingerprinter, InputProvider, ModuleInputs, NoSessionModules,
};

pub mod repository;
pub use repository::{
    local::LocalRepository,
    remote::{HttpTransport, RemoteRepository, RemoteTransport},
};

pub mod reconcile;
pub use reconcile::{Mismatch, ReconciliationEngine};

pub mod restore;
pub use restore::{RestoreOutcome, RestoredFile, Restorer, StagingArea};

pub mod save;
pub use save::{SaveResult, Saver};

pub mod report;
pub use report::{CacheReport, DiffReport};

pub mod coordinator;
pub use coordinator::{CacheCoordinator, ModuleOutcome, ModuleRequest, RunContext};
