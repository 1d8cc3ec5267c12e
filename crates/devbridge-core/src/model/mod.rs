// ── Domain model ──
//
// Devices, their capability declarations, cached state, and commands.

pub mod capability;
pub mod command;
pub mod device;

pub use capability::{CapabilityModel, FieldKind, FieldProblem, FieldSpec, FieldType};
pub use command::{Command, CommandOutcome, CommandPhase};
pub use device::{DeviceDescriptor, DeviceState};
