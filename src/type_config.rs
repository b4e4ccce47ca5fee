use std::fmt::Debug;

use crate::HybridClock;
use crate::MetaStore;
use crate::PeerProxyFactory;
use crate::WalLog;

/// Binds the collaborator seams of one deployment into a single marker type,
/// so every component names its dependencies through one parameter instead
/// of a generics zoo.
pub trait TypeConfig:
    Sync + Send + Sized + Debug + Clone + Copy + Default + Eq + PartialEq + Ord + PartialOrd + 'static
{
    /// The write-ahead log the tablet server provides.
    type Wal: WalLog;

    /// Durable consensus metadata store.
    type Meta: MetaStore;

    /// Resolves config members to outbound RPC proxies.
    type PF: PeerProxyFactory;

    /// Hybrid-time source for leases and operation timestamps.
    type Clock: HybridClock;
}

pub mod alias {
    use super::TypeConfig;

    pub type WOF<T> = <T as TypeConfig>::Wal;

    pub type MSOF<T> = <T as TypeConfig>::Meta;

    pub type PFOF<T> = <T as TypeConfig>::PF;

    pub type CKOF<T> = <T as TypeConfig>::Clock;
}
