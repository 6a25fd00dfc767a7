pub mod release;

pub use release::{
    ModuleRelease, ModuleReleaseSpec, PlatformRelease, PlatformReleaseSpec, ReleasePhase,
    ReleaseStatus,
};
