//! Per-service PPP session records: identity, phase ladder, transport
//! subtype, frozen connect options and the exit-code taxonomy surfaced to
//! clients when a link dies.

use crate::client::ClientId;
use crate::options::OptionSet;
use std::time::Instant;
use strand::logging;

/// PPP engine lifecycle, as reported over the privileged side-channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Phase {
    Idle = 0,
    Initialize = 1,
    SerialConn = 2,
    Establish = 3,
    Authenticate = 4,
    Network = 5,
    Running = 6,
    Disconnect = 7,
    Holdoff = 8,
    Dead = 9,
}

impl Phase {
    pub fn from_code(code: u32) -> Option<Phase> {
        match code {
            0 => Some(Phase::Idle),
            1 => Some(Phase::Initialize),
            2 => Some(Phase::SerialConn),
            3 => Some(Phase::Establish),
            4 => Some(Phase::Authenticate),
            5 => Some(Phase::Network),
            6 => Some(Phase::Running),
            7 => Some(Phase::Disconnect),
            8 => Some(Phase::Holdoff),
            9 => Some(Phase::Dead),
            _ => None,
        }
    }

    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Underlying transport of a session. The numeric value is the subtype
/// selector used in the high 16 bits of `link` on listing requests.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SubType {
    Serial = 0,
    PPPoE = 1,
    PPTP = 2,
    L2TP = 3,
}

/// Wildcard subtype selector on listing requests.
pub const SUBTYPE_ANY: u16 = 0xFFFF;

impl SubType {
    pub fn from_name(name: &str) -> Option<SubType> {
        match name {
            "serial" => Some(SubType::Serial),
            "pppoe" => Some(SubType::PPPoE),
            "pptp" => Some(SubType::PPTP),
            "l2tp" => Some(SubType::L2TP),
            _ => None,
        }
    }

    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }
}

// Exit codes of the PPP engine. A small closed set; transport-specific
// subcodes are folded into the low byte of the translated word.
pub const EXIT_OPTION_ERROR: u32 = 2;
pub const EXIT_OPEN_FAILED: u32 = 7;
pub const EXIT_CONNECT_FAILED: u32 = 8;
pub const EXIT_HANGUP: u32 = 16;
pub const EXIT_AUTH_FAILED: u32 = 19;

// PPPoE connect-failure subcodes, reported by the engine as raw exit codes.
pub const PPPOE_NOSERVER: u32 = 1;
pub const PPPOE_NOSERVICE: u32 = 2;
pub const PPPOE_NOAC: u32 = 3;
pub const PPPOE_NOACSERVICE: u32 = 4;
pub const PPPOE_CONNREFUSED: u32 = 5;

/// Maps a raw engine exit code into the wire taxonomy. Transport-specific
/// failures become CONNECT_FAILED with the subcode in the low byte.
pub fn translate_error(subtype: SubType, error: u32) -> u32 {
    match subtype {
        SubType::PPPoE if (PPPOE_NOSERVER..=PPPOE_CONNREFUSED).contains(&error) => {
            (EXIT_CONNECT_FAILED << 8) | error
        }
        _ => error,
    }
}

/// Traffic counters surfaced in STATUS replies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub in_bytes: u32,
    pub in_packets: u32,
    pub in_errors: u32,
    pub out_bytes: u32,
    pub out_packets: u32,
    pub out_errors: u32,
}

pub struct Session {
    pub serviceid: String,
    pub serverid: Option<String>,
    pub unit: u16,
    pub ifname: String,
    pub subtype: SubType,
    pub phase: Phase,
    /// Status word published by the engine; phase code when idle.
    pub status: u32,
    pub devstatus: u32,
    pub last_disc_cause: u32,
    /// Administrator preferences from the persisted configuration store.
    pub setup: OptionSet,
    /// Option snapshot frozen at connect time, released on teardown.
    pub connect_opts: Option<OptionSet>,
    /// Client that arbitrates this connection, when requested.
    pub owner: Option<ClientId>,
    pub autoclose: bool,
    pub connected_since: Option<Instant>,
    pub stats: Stats,
    /// In-process control tunnel for L2TP-subtype sessions.
    pub tunnel: Option<l2tp::Handle>,
    pub log: logging::Logger,
}

impl Session {
    pub fn new(
        serviceid: String,
        serverid: Option<String>,
        unit: u16,
        subtype: SubType,
        setup: OptionSet,
        log: &logging::Logger,
    ) -> Session {
        let ifname = format!("ppp{}", unit);
        let log = log.new(logging::o!("serviceid" => serviceid.clone()));

        Session {
            serviceid,
            serverid,
            unit,
            ifname,
            subtype,
            phase: Phase::Idle,
            status: Phase::Idle.code(),
            devstatus: 0,
            last_disc_cause: 0,
            setup,
            connect_opts: None,
            owner: None,
            autoclose: false,
            connected_since: None,
            stats: Stats::default(),
            tunnel: None,
            log,
        }
    }

    /// The numeric handle clients use: subtype in the high half, interface
    /// unit in the low half.
    #[inline]
    pub fn makeref(&self) -> u32 {
        (u32::from(self.subtype.code()) << 16) | u32::from(self.unit)
    }

    #[inline]
    pub fn matches_subtype(&self, selector: u16) -> bool {
        selector == SUBTYPE_ANY || selector == self.subtype.code()
    }

    pub fn update_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }

        logging::debug!(self.log, "phase change";
                        "from" => ?self.phase,
                        "to" => ?phase);
        self.phase = phase;

        match phase {
            Phase::Running => self.connected_since = Some(Instant::now()),
            Phase::Idle | Phase::Dead => self.connected_since = None,
            _ => {}
        }
    }

    pub fn update_status(&mut self, status: u32, devstatus: u32) {
        self.status = status;
        self.devstatus = devstatus;
    }

    /// Seconds since the link reached RUNNING.
    #[inline]
    pub fn time_elapsed(&self) -> u32 {
        self.connected_since
            .map_or(0, |since| since.elapsed().as_secs() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(subtype: SubType, unit: u16) -> Session {
        Session::new(
            format!("net.test.{}", unit),
            None,
            unit,
            subtype,
            OptionSet::default(),
            &strand::logging::discard(),
        )
    }

    #[test]
    fn test_makeref_folds_subtype_and_unit() {
        let l2tp = session(SubType::L2TP, 2);
        assert_eq!(l2tp.makeref(), 0x0003_0002);

        let serial = session(SubType::Serial, 7);
        assert_eq!(serial.makeref(), 0x0000_0007);
    }

    #[test]
    fn test_subtype_filter() {
        let pppoe = session(SubType::PPPoE, 0);

        assert!(pppoe.matches_subtype(SUBTYPE_ANY));
        assert!(pppoe.matches_subtype(SubType::PPPoE.code()));
        assert!(!pppoe.matches_subtype(SubType::L2TP.code()));
    }

    #[test]
    fn test_translate_error_folds_pppoe_subcode() {
        assert_eq!(
            translate_error(SubType::PPPoE, PPPOE_CONNREFUSED),
            (EXIT_CONNECT_FAILED << 8) | PPPOE_CONNREFUSED
        );
        // other subtypes pass through untouched
        assert_eq!(translate_error(SubType::L2TP, EXIT_HANGUP), EXIT_HANGUP);
        assert_eq!(
            translate_error(SubType::Serial, EXIT_AUTH_FAILED),
            EXIT_AUTH_FAILED
        );
    }

    #[test]
    fn test_phase_codes_roundtrip() {
        for code in 0..=9u32 {
            let phase = Phase::from_code(code).unwrap();
            assert_eq!(phase.code(), code);
        }
        assert_eq!(Phase::from_code(42), None);
    }

    #[test]
    fn test_ifname_follows_unit() {
        assert_eq!(session(SubType::Serial, 3).ifname, "ppp3");
    }
}
