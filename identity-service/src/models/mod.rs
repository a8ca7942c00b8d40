pub mod code;
pub mod container;
pub mod exchanger;
pub mod flow;
pub mod identity;

pub use code::{CodeKind, OneTimeCode};
pub use container::Container;
pub use exchanger::SessionTokenExchange;
pub use flow::{Flow, FlowKind, FlowState};
pub use identity::{
    AddressStatus, Channel, Credentials, CredentialsType, Identity, RecoveryAddress,
    VerifiableAddress,
};
