//! nxswitch: the I/O half of the connection-switching proxy.
//!
//! Once a [`SwitchDecision`](nxswitch_core::SwitchDecision) has been parsed,
//! this crate opens the proxy connection it names, hands descriptors to the
//! channel or bridges them with a blocking poll loop, and tunes every socket
//! that ends up carrying switched traffic. Everything here is
//! single-threaded and blocking.

pub mod channel;
pub mod config;
pub mod establish;
pub mod forward;
pub mod input;
pub mod resolver;
pub mod switcher;
pub mod sys;
pub mod transport;
pub mod tuner;

pub use channel::{Channel, ChannelKind};
pub use config::{Overrides, SwitchConfig};
pub use establish::{AcceptPolicy, AgentIdentity, ConnectPolicy, ConnectionEstablisher};
pub use forward::{ClosePolicy, ForwardReport, ForwardingSession, LoopExit};
pub use input::check_standard_input;
pub use switcher::{redirect_log_output, DescriptorSwitcher};
pub use transport::{proxy_select, NoTransport, Transport};
