pub mod fs;
pub mod netlink;
pub mod proc;
