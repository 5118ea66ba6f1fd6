//! Identity types shared across the control plane.

use std::fmt;

/// Instance id of a module inside a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleInstanceId(pub u32);

/// Control port id, unique within one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

/// Container-wide identity of a control port.
///
/// Ports are addressed through this key everywhere; nothing holds a reference
/// into the port table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey {
    pub module: ModuleInstanceId,
    pub port: PortId,
}

impl PortKey {
    pub fn new(module: u32, port: u32) -> Self {
        Self {
            module: ModuleInstanceId(module),
            port: PortId(port),
        }
    }
}

/// Memory/power domain a port or container operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerDomain {
    /// Low-power island; only island-safe memory may be touched
    Island,
    #[default]
    NonIsland,
}

impl PowerDomain {
    pub fn is_island(self) -> bool {
        self == PowerDomain::Island
    }
}

impl fmt::Display for ModuleInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.port)
    }
}
