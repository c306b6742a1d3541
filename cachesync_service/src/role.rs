//! The role a server plays in the farm, as far as the instruction log is concerned.

use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ServerRole {
    /// The only server, or no farm at all.
    Single,
    /// The one server of the farm that runs scheduled work.
    SchedulingPublisher,
    Publisher,
    Subscriber,
    #[default]
    Unknown,
}

impl ServerRole {
    /// Only one server should prune the shared log, the one that also runs scheduled work.
    pub fn grants_pruning(&self) -> bool {
        matches!(self, Self::Single | Self::SchedulingPublisher)
    }
}

impl Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::SchedulingPublisher => write!(f, "scheduling-publisher"),
            Self::Publisher => write!(f, "publisher"),
            Self::Subscriber => write!(f, "subscriber"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid server role {0:?}, expected one of single, scheduling-publisher, publisher, subscriber, unknown")]
pub struct InvalidServerRole(String);

impl FromStr for ServerRole {
    type Err = InvalidServerRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "scheduling-publisher" | "scheduling_publisher" => Ok(Self::SchedulingPublisher),
            "publisher" => Ok(Self::Publisher),
            "subscriber" => Ok(Self::Subscriber),
            "unknown" => Ok(Self::Unknown),
            _ => Err(InvalidServerRole(s.to_string())),
        }
    }
}

/// Tells the sync driver which role this server currently holds. Election itself happens
/// elsewhere, the role may change between two sync cycles.
pub trait ServerRoleProvider: std::fmt::Debug + Send + Sync + 'static {
    fn current_role(&self) -> ServerRole;
}

/// A server whose role is fixed by configuration.
impl ServerRoleProvider for ServerRole {
    fn current_role(&self) -> ServerRole {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_single_and_scheduling_publisher_prune() {
        assert!(ServerRole::Single.grants_pruning());
        assert!(ServerRole::SchedulingPublisher.grants_pruning());
        assert!(!ServerRole::Publisher.grants_pruning());
        assert!(!ServerRole::Subscriber.grants_pruning());
        assert!(!ServerRole::Unknown.grants_pruning());
        assert!(!ServerRole::default().grants_pruning());
    }

    #[test]
    fn parse_and_display() {
        for role in [
            ServerRole::Single,
            ServerRole::SchedulingPublisher,
            ServerRole::Publisher,
            ServerRole::Subscriber,
            ServerRole::Unknown,
        ] {
            assert_eq!(role.to_string().parse::<ServerRole>().unwrap(), role);
        }
        assert_eq!(
            "Scheduling_Publisher".parse::<ServerRole>().unwrap(),
            ServerRole::SchedulingPublisher
        );
        assert!("master".parse::<ServerRole>().is_err());
    }
}
