//! Проекция состояний движка в трёхцветный индикатор для UI.

use crate::peer::types::{ConnectionState, IceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Indicator {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusReport {
    pub connection: Indicator,
    pub ice: Indicator,
}

pub fn connection_indicator(state: ConnectionState) -> Indicator {
    match state {
        ConnectionState::Connected => Indicator::Connected,
        ConnectionState::New | ConnectionState::Connecting => Indicator::Connecting,
        ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed => {
            Indicator::Disconnected
        }
    }
}

pub fn ice_indicator(state: IceState) -> Indicator {
    match state {
        IceState::Connected | IceState::Completed => Indicator::Connected,
        IceState::New | IceState::Checking => Indicator::Connecting,
        IceState::Disconnected | IceState::Failed | IceState::Closed => Indicator::Disconnected,
    }
}

/// Чистая функция, можно звать на каждое уведомление движка
pub fn project(connection: ConnectionState, ice: IceState) -> StatusReport {
    StatusReport {
        connection: connection_indicator(connection),
        ice: ice_indicator(ice),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_states_project_to_connected() {
        let report = project(ConnectionState::Connected, IceState::Connected);
        assert_eq!(report.connection, Indicator::Connected);
        assert_eq!(report.ice, Indicator::Connected);
        assert_eq!(ice_indicator(IceState::Completed), Indicator::Connected);
    }

    #[test]
    fn pending_states_project_to_connecting() {
        assert_eq!(connection_indicator(ConnectionState::New), Indicator::Connecting);
        assert_eq!(
            connection_indicator(ConnectionState::Connecting),
            Indicator::Connecting
        );
        assert_eq!(ice_indicator(IceState::New), Indicator::Connecting);
        assert_eq!(ice_indicator(IceState::Checking), Indicator::Connecting);
    }

    #[test]
    fn terminal_states_project_to_disconnected() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Failed,
            ConnectionState::Closed,
        ] {
            assert_eq!(connection_indicator(state), Indicator::Disconnected);
        }
        for state in [IceState::Disconnected, IceState::Failed, IceState::Closed] {
            assert_eq!(ice_indicator(state), Indicator::Disconnected);
        }
    }
}
