pub mod caps;
pub mod cgroups;
pub mod handshake;
pub mod mounts;
pub mod net;
pub mod stdio;
pub mod subsystem;
pub mod task;
