//! Builtin function nodes.

mod cat;
mod emit;
mod exit;
mod grep;
mod head;
mod sleep;
mod upper;

pub use cat::Cat;
pub use emit::Emit;
pub use exit::Exit;
pub use grep::Grep;
pub use head::Head;
pub use sleep::Sleep;
pub use upper::Upper;

use super::FunctionRegistry;

/// Register all builtin functions with the registry.
pub fn register_builtins(registry: &mut FunctionRegistry) {
    registry.register(Cat);
    registry.register(Emit);
    registry.register(Exit);
    registry.register(Grep);
    registry.register(Head);
    registry.register(Sleep);
    registry.register(Upper);
}
