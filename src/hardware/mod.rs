//! Hardware access: the register transport capability, the serialized
//! channel that owns it, the register layout, and a simulated controller.

pub mod channel;
pub mod registers;
pub mod simulator;
pub mod transport;

pub use channel::RegisterChannel;
pub use registers::RegisterMap;
pub use simulator::{MachineSimulation, SimulatedController};
pub use transport::{LinkInfo, RegisterTransport};
