// warden/src/engine/mod.rs
//
// Threat synthesis and response decisions.
//
//   fusion    observations → Threats (windowed, per subject)
//   policy    Threat → ResponseAction + Notification
//   cooldown  per-(subject, category) suppression after enforcement
//   safelist  subjects exempt from automated action

pub mod cooldown;
pub mod fusion;
pub mod policy;
pub mod safelist;

pub use cooldown::{CooldownEntry, CooldownTracker};
pub use fusion::{FusionEngine, FusionStage};
pub use policy::{PolicyEngine, PolicyStage};
pub use safelist::SafeList;
