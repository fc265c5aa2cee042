pub mod addr;
pub mod bridged;
pub mod dhcp;
pub mod host;
pub mod planner;
pub mod portmap;
pub mod types;

pub use addr::{gen_non_conflicting_ip, get_unused_ip, Ipv4Cidr};
pub use bridged::setup_bridge;
pub use dhcp::{configure_dhcp, select_default_network, DefaultNetwork};
pub use planner::{configure_network, get_interface_ipnets, get_vm_interfaces};
pub use portmap::configure_port_forward;
pub use types::*;
