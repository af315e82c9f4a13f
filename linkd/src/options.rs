//! The option store: typed per-session settings keyed by entity and
//! property, with a three-tier lookup (live state, per-client overrides,
//! persisted setup) and the closed numeric option-id surface used by the
//! client control protocol.

use crate::msg;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};

/// Longest string value handed out by the typed extractors.
pub const OPT_STR_LEN: usize = 256;

/// Stable entity names, shared with the persisted configuration store.
pub mod entities {
    pub const PPP: &str = "PPP";
    pub const MODEM: &str = "Modem";
    pub const IPV4: &str = "IPv4";
    pub const INTERFACE: &str = "Interface";
    pub const L2TP: &str = "L2TP";
}

/// Stable property names within the entities.
pub mod props {
    pub const DEVICE_NAME: &str = "DeviceName";
    pub const SPEED: &str = "Speed";
    pub const CONNECTION_SCRIPT: &str = "ConnectionScript";
    pub const DIAL_MODE: &str = "DialMode";
    pub const TERMINAL_MODE: &str = "TerminalMode";
    pub const TERMINAL_SCRIPT: &str = "TerminalScript";
    pub const REMOTE_ADDRESS: &str = "CommRemoteAddress";
    pub const IDLE_TIMER: &str = "DisconnectOnIdleTimer";
    pub const SESSION_TIMER: &str = "SessionTimer";
    pub const CONNECT_DELAY: &str = "CommConnectDelay";
    pub const REMINDER_TIMER: &str = "IdleReminderTimer";
    pub const ALERT_ENABLE: &str = "AlertEnable";
    pub const LCP_COMPRESSION_PFIELD: &str = "LCPCompressionPField";
    pub const LCP_COMPRESSION_ACFIELD: &str = "LCPCompressionACField";
    pub const LCP_MRU: &str = "LCPMRU";
    pub const LCP_MTU: &str = "LCPMTU";
    pub const LCP_RECEIVE_ACCM: &str = "LCPReceiveACCM";
    pub const LCP_TRANSMIT_ACCM: &str = "LCPTransmitACCM";
    pub const LCP_ECHO_INTERVAL: &str = "LCPEchoInterval";
    pub const LCP_ECHO_FAILURE: &str = "LCPEchoFailure";
    pub const AUTH_PROTOCOL: &str = "AuthProtocol";
    pub const AUTH_NAME: &str = "AuthName";
    pub const AUTH_PASSWORD: &str = "AuthPassword";
    pub const IPCP_COMPRESSION_VJ: &str = "IPCPCompressionVJ";
    pub const ADDRESSES: &str = "Addresses";
    pub const DEST_ADDRESSES: &str = "DestAddresses";
    pub const NO_KERNEL_LOAD: &str = "NoKernelLoad";
    pub const LOOP_LOCAL: &str = "LoopLocal";
    pub const ADD_IF_ROUTE: &str = "AddIfRoute";
    pub const TRANSPORT_WINDOW: &str = "TransportWindow";
    pub const TRANSPORT_TIMEOUT: &str = "TransportTimeout";
    pub const TRANSPORT_TIMEOUT_CAP: &str = "TransportTimeoutCap";
    pub const TRANSPORT_RETRIES: &str = "TransportRetries";
    pub const LOCAL_ADDRESS: &str = "CommLocalAddress";
}

// The closed numeric option-id set of the control protocol.
pub const OPT_DEV_NAME: u32 = 1;
pub const OPT_DEV_SPEED: u32 = 2;
pub const OPT_DEV_CONNECTSCRIPT: u32 = 3;
pub const OPT_DEV_DIALMODE: u32 = 4;
pub const OPT_COMM_TERMINALMODE: u32 = 5;
pub const OPT_COMM_TERMINALSCRIPT: u32 = 6;
pub const OPT_COMM_REMOTEADDR: u32 = 7;
pub const OPT_COMM_IDLETIMER: u32 = 8;
pub const OPT_COMM_SESSIONTIMER: u32 = 9;
pub const OPT_COMM_CONNECTDELAY: u32 = 10;
pub const OPT_COMM_REMINDERTIMER: u32 = 11;
pub const OPT_LCP_HDRCOMP: u32 = 12;
pub const OPT_LCP_MRU: u32 = 13;
pub const OPT_LCP_MTU: u32 = 14;
pub const OPT_LCP_RCACCM: u32 = 15;
pub const OPT_LCP_TXACCM: u32 = 16;
pub const OPT_LCP_ECHO: u32 = 17;
pub const OPT_AUTH_PROTO: u32 = 18;
pub const OPT_AUTH_NAME: u32 = 19;
pub const OPT_AUTH_PASSWD: u32 = 20;
pub const OPT_IPCP_HDRCOMP: u32 = 21;
pub const OPT_IPCP_LOCALADDR: u32 = 22;
pub const OPT_IPCP_REMOTEADDR: u32 = 23;
pub const OPT_ALERTENABLE: u32 = 24;

// LCP header compression sub-bits
pub const LCP_HDRCOMP_PROTO: u32 = 0x1;
pub const LCP_HDRCOMP_ADDR: u32 = 0x2;

// auth protocol selectors
pub const AUTH_NONE: u32 = 0;
pub const AUTH_PAP: u32 = 1;
pub const AUTH_CHAP: u32 = 2;
pub const AUTH_PAPCHAP: u32 = 3;

/// A typed option value. The JSON form is untagged, so an option set
/// serializes the way an administrator would write it by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(u32),
    Str(String),
    List(Vec<String>),
}

/// One option set: entity name to property name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionSet(HashMap<String, HashMap<String, Value>>);

impl OptionSet {
    pub fn new() -> OptionSet {
        OptionSet(HashMap::new())
    }

    pub fn get(&self, entity: &str, property: &str) -> Option<&Value> {
        self.0.get(entity).and_then(|props| props.get(property))
    }

    /// Replaces any previous value of (entity, property).
    pub fn set(&mut self, entity: &str, property: &str, value: Value) {
        self.0
            .entry(entity.to_string())
            .or_insert_with(HashMap::new)
            .insert(property.to_string(), value);
    }

    pub fn remove(&mut self, entity: &str, property: &str) {
        if let Some(props) = self.0.get_mut(entity) {
            props.remove(property);
        }
    }

    #[inline]
    pub fn int(&self, entity: &str, property: &str) -> Option<u32> {
        match self.get(entity, property) {
            Some(Value::Int(value)) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn str(&self, entity: &str, property: &str) -> Option<&str> {
        match self.get(entity, property) {
            Some(Value::Str(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    #[inline]
    pub fn list(&self, entity: &str, property: &str) -> Option<&[String]> {
        match self.get(entity, property) {
            Some(Value::List(values)) => Some(&values[..]),
            _ => None,
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<OptionSet, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Option sets always serialize")
    }
}

/// Which tier satisfied a lookup.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Tier {
    Default,
    State,
    Client,
    Setup,
}

/// The tri-layer view consulted for effective settings: authoritative live
/// state first (present only while the session is active), then the
/// client's explicit overrides, then the administrator's persisted setup.
/// The caller's default is used when nothing hits.
#[derive(Clone, Copy, Default)]
pub struct OptionView<'a> {
    pub state: Option<&'a OptionSet>,
    pub client: Option<&'a OptionSet>,
    pub setup: Option<&'a OptionSet>,
}

impl<'a> OptionView<'a> {
    fn tiers(&self) -> [(Option<&'a OptionSet>, Tier); 3] {
        [
            (self.state, Tier::State),
            (self.client, Tier::Client),
            (self.setup, Tier::Setup),
        ]
    }

    pub fn get_int(&self, entity: &str, property: &str, default: u32) -> (u32, Tier) {
        for (set, tier) in self.tiers().iter() {
            if let Some(value) = set.and_then(|set| set.int(entity, property)) {
                return (value, *tier);
            }
        }
        (default, Tier::Default)
    }

    /// Bounded string lookup; values longer than `OPT_STR_LEN` are cut.
    pub fn get_str(&self, entity: &str, property: &str, default: &str) -> (String, Tier) {
        for (set, tier) in self.tiers().iter() {
            if let Some(value) = set.and_then(|set| set.str(entity, property)) {
                return (bounded(value), *tier);
            }
        }
        (bounded(default), Tier::Default)
    }

    /// Address lookup: a dotted quad stored as a string, or the first
    /// element of a string list, returned as a host-order u32.
    pub fn get_addr(&self, entity: &str, property: &str, default: u32) -> (u32, Tier) {
        for (set, tier) in self.tiers().iter() {
            let candidate = set.and_then(|set| match set.get(entity, property) {
                Some(Value::Str(value)) => Some(value.as_str()),
                Some(Value::List(values)) => values.first().map(|value| value.as_str()),
                _ => None,
            });

            if let Some(value) = candidate.and_then(parse_dotted_quad) {
                return (value, *tier);
            }
        }
        (default, Tier::Default)
    }

    /// Arbitrary value filtered by expected shape; live state is not
    /// consulted, matching the persisted/override-only callers.
    pub fn get_value(&self, entity: &str, property: &str, want_list: bool) -> Option<&'a Value> {
        for set in [self.client, self.setup].iter().copied().flatten() {
            if let Some(value) = set.get(entity, property) {
                let matches = match value {
                    Value::List(_) => want_list,
                    _ => !want_list,
                };
                if matches {
                    return Some(value);
                }
            }
        }
        None
    }
}

fn bounded(value: &str) -> String {
    if value.len() <= OPT_STR_LEN {
        return value.to_string();
    }

    let mut cut = OPT_STR_LEN;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value[..cut].to_string()
}

/// Parses a dotted quad into a host-order u32. Rejects anything that is
/// not exactly four in-range octets.
pub fn parse_dotted_quad(text: &str) -> Option<u32> {
    let mut parts = text.split('.');
    let mut addr: u32 = 0;

    for _ in 0..4 {
        let octet: u32 = parts.next()?.parse().ok()?;
        if octet > 255 {
            return None;
        }
        addr = (addr << 8) | octet;
    }

    if parts.next().is_some() {
        return None;
    }

    Some(addr)
}

pub fn format_dotted_quad(addr: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        addr >> 24,
        (addr >> 16) & 0xFF,
        (addr >> 8) & 0xFF,
        addr & 0xFF
    )
}

/// Serial speeds are snapped up to the next step of a fixed ladder.
pub fn snap_speed(speed: u32) -> u32 {
    if speed <= 1200 {
        1200
    } else if speed <= 2400 {
        2400
    } else if speed <= 9600 {
        9600
    } else if speed <= 19200 {
        19200
    } else if speed <= 38400 {
        38400
    } else if speed <= 57600 {
        57600
    } else {
        115200
    }
}

/// Range-validated integer set: clamps into range or rejects with EINVAL
/// depending on `clamp`.
fn set_int_opt(
    opts: &mut OptionSet,
    entity: &str,
    property: &str,
    value: u32,
    min: u32,
    max: u32,
    clamp: bool,
) -> Result<(), u32> {
    let value = if value < min {
        if !clamp {
            return Err(msg::EINVAL);
        }
        min
    } else if value > max {
        if !clamp {
            return Err(msg::EINVAL);
        }
        max
    } else {
        value
    };

    opts.set(entity, property, Value::Int(value));
    Ok(())
}

fn set_str_opt(opts: &mut OptionSet, entity: &str, property: &str, data: &[u8]) -> Result<(), u32> {
    let text = String::from_utf8_lossy(data);
    let text = text.trim_end_matches('\0');
    opts.set(entity, property, Value::Str(bounded(text)));
    Ok(())
}

/// Applies one SET_OPTION request to a client's override set. `data` is
/// the option payload after the option-type word; integer payloads are in
/// the client's byte order.
pub fn set_option(opts: &mut OptionSet, otype: u32, data: &[u8], swap: bool) -> Result<(), u32> {
    let int_arg = |at: usize| -> Result<u32, u32> {
        if data.len() < at + 4 {
            return Err(msg::EINVAL);
        }
        Ok(msg::read_u32_body(&data[at..], swap))
    };

    match otype {
        OPT_DEV_NAME => set_str_opt(opts, entities::INTERFACE, props::DEVICE_NAME, data),
        OPT_DEV_SPEED => {
            let speed = snap_speed(int_arg(0)?);
            set_int_opt(opts, entities::MODEM, props::SPEED, speed, 0, u32::max_value(), false)
        }
        OPT_DEV_CONNECTSCRIPT => {
            set_str_opt(opts, entities::MODEM, props::CONNECTION_SCRIPT, data)
        }
        OPT_DEV_DIALMODE => {
            set_int_opt(opts, entities::MODEM, props::DIAL_MODE, int_arg(0)?, 0, 2, true)
        }
        OPT_COMM_TERMINALMODE => {
            set_int_opt(opts, entities::PPP, props::TERMINAL_MODE, int_arg(0)?, 0, 2, true)
        }
        OPT_COMM_TERMINALSCRIPT => set_str_opt(opts, entities::PPP, props::TERMINAL_SCRIPT, data),
        OPT_COMM_REMOTEADDR => set_str_opt(opts, entities::PPP, props::REMOTE_ADDRESS, data),
        OPT_COMM_IDLETIMER => set_int_opt(
            opts,
            entities::PPP,
            props::IDLE_TIMER,
            int_arg(0)?,
            0,
            u32::max_value(),
            true,
        ),
        OPT_COMM_SESSIONTIMER => set_int_opt(
            opts,
            entities::PPP,
            props::SESSION_TIMER,
            int_arg(0)?,
            0,
            u32::max_value(),
            true,
        ),
        OPT_COMM_CONNECTDELAY => set_int_opt(
            opts,
            entities::PPP,
            props::CONNECT_DELAY,
            int_arg(0)?,
            0,
            u32::max_value(),
            true,
        ),
        OPT_COMM_REMINDERTIMER => set_int_opt(
            opts,
            entities::PPP,
            props::REMINDER_TIMER,
            int_arg(0)?,
            0,
            u32::max_value(),
            true,
        ),
        OPT_LCP_HDRCOMP => {
            let bits = int_arg(0)?;
            set_int_opt(
                opts,
                entities::PPP,
                props::LCP_COMPRESSION_PFIELD,
                u32::from(bits & LCP_HDRCOMP_PROTO != 0),
                0,
                1,
                true,
            )?;
            set_int_opt(
                opts,
                entities::PPP,
                props::LCP_COMPRESSION_ACFIELD,
                u32::from(bits & LCP_HDRCOMP_ADDR != 0),
                0,
                1,
                true,
            )
        }
        OPT_LCP_MRU => set_int_opt(
            opts,
            entities::PPP,
            props::LCP_MRU,
            int_arg(0)?,
            0,
            u32::max_value(),
            true,
        ),
        OPT_LCP_MTU => set_int_opt(
            opts,
            entities::PPP,
            props::LCP_MTU,
            int_arg(0)?,
            0,
            u32::max_value(),
            true,
        ),
        OPT_LCP_RCACCM => set_int_opt(
            opts,
            entities::PPP,
            props::LCP_RECEIVE_ACCM,
            int_arg(0)?,
            0,
            u32::max_value(),
            true,
        ),
        OPT_LCP_TXACCM => set_int_opt(
            opts,
            entities::PPP,
            props::LCP_TRANSMIT_ACCM,
            int_arg(0)?,
            0,
            u32::max_value(),
            true,
        ),
        OPT_LCP_ECHO => {
            set_int_opt(
                opts,
                entities::PPP,
                props::LCP_ECHO_INTERVAL,
                int_arg(0)?,
                0,
                u32::max_value(),
                true,
            )?;
            set_int_opt(
                opts,
                entities::PPP,
                props::LCP_ECHO_FAILURE,
                int_arg(4)?,
                0,
                u32::max_value(),
                true,
            )
        }
        OPT_AUTH_PROTO => {
            let protocols = match int_arg(0)? {
                AUTH_NONE => vec!["None".to_string()],
                AUTH_PAP => vec!["PAP".to_string()],
                AUTH_CHAP => vec!["CHAP".to_string()],
                AUTH_PAPCHAP => vec!["PAP".to_string(), "CHAP".to_string()],
                _ => return Err(msg::EINVAL),
            };
            opts.set(entities::PPP, props::AUTH_PROTOCOL, Value::List(protocols));
            Ok(())
        }
        OPT_AUTH_NAME => set_str_opt(opts, entities::PPP, props::AUTH_NAME, data),
        OPT_AUTH_PASSWD => set_str_opt(opts, entities::PPP, props::AUTH_PASSWORD, data),
        OPT_IPCP_HDRCOMP => set_int_opt(
            opts,
            entities::PPP,
            props::IPCP_COMPRESSION_VJ,
            int_arg(0)?,
            0,
            1,
            true,
        ),
        OPT_IPCP_LOCALADDR => {
            let addr = format_dotted_quad(int_arg(0)?);
            opts.set(entities::IPV4, props::ADDRESSES, Value::List(vec![addr]));
            Ok(())
        }
        OPT_IPCP_REMOTEADDR => {
            let addr = format_dotted_quad(int_arg(0)?);
            opts.set(entities::IPV4, props::DEST_ADDRESSES, Value::List(vec![addr]));
            Ok(())
        }
        OPT_ALERTENABLE => set_int_opt(
            opts,
            entities::PPP,
            props::ALERT_ENABLE,
            int_arg(0)?,
            0,
            u32::max_value(),
            true,
        ),
        _ => Err(msg::EOPNOTSUPP),
    }
}

/// Produces the GET_OPTION reply payload for an option id, in the client's
/// byte order. `None` when the option id is outside the known set.
pub fn get_option(view: &OptionView, otype: u32, swap: bool) -> Option<Vec<u8>> {
    let int_reply = |value: u32| msg::write_u32_body(value, swap).to_vec();
    let str_reply = |value: String| value.into_bytes();

    let payload = match otype {
        OPT_DEV_NAME => str_reply(
            view.get_str(entities::INTERFACE, props::DEVICE_NAME, "").0,
        ),
        OPT_DEV_SPEED => int_reply(view.get_int(entities::MODEM, props::SPEED, 115_200).0),
        OPT_DEV_CONNECTSCRIPT => {
            str_reply(view.get_str(entities::MODEM, props::CONNECTION_SCRIPT, "").0)
        }
        OPT_DEV_DIALMODE => int_reply(view.get_int(entities::MODEM, props::DIAL_MODE, 0).0),
        OPT_COMM_TERMINALMODE => int_reply(view.get_int(entities::PPP, props::TERMINAL_MODE, 0).0),
        OPT_COMM_TERMINALSCRIPT => {
            str_reply(view.get_str(entities::PPP, props::TERMINAL_SCRIPT, "").0)
        }
        OPT_COMM_REMOTEADDR => str_reply(view.get_str(entities::PPP, props::REMOTE_ADDRESS, "").0),
        OPT_COMM_IDLETIMER => int_reply(view.get_int(entities::PPP, props::IDLE_TIMER, 0).0),
        OPT_COMM_SESSIONTIMER => int_reply(view.get_int(entities::PPP, props::SESSION_TIMER, 0).0),
        OPT_COMM_CONNECTDELAY => int_reply(view.get_int(entities::PPP, props::CONNECT_DELAY, 0).0),
        OPT_COMM_REMINDERTIMER => {
            int_reply(view.get_int(entities::PPP, props::REMINDER_TIMER, 0).0)
        }
        OPT_LCP_HDRCOMP => {
            let proto = view
                .get_int(entities::PPP, props::LCP_COMPRESSION_PFIELD, 1)
                .0;
            let addr = view
                .get_int(entities::PPP, props::LCP_COMPRESSION_ACFIELD, 1)
                .0;
            int_reply(
                (if proto != 0 { LCP_HDRCOMP_PROTO } else { 0 })
                    | (if addr != 0 { LCP_HDRCOMP_ADDR } else { 0 }),
            )
        }
        OPT_LCP_MRU => int_reply(view.get_int(entities::PPP, props::LCP_MRU, 1500).0),
        OPT_LCP_MTU => int_reply(view.get_int(entities::PPP, props::LCP_MTU, 1500).0),
        OPT_LCP_RCACCM => int_reply(view.get_int(entities::PPP, props::LCP_RECEIVE_ACCM, 0).0),
        OPT_LCP_TXACCM => int_reply(view.get_int(entities::PPP, props::LCP_TRANSMIT_ACCM, 0).0),
        OPT_LCP_ECHO => {
            let mut payload = int_reply(view.get_int(entities::PPP, props::LCP_ECHO_INTERVAL, 0).0);
            payload.extend_from_slice(&msg::write_u32_body(
                view.get_int(entities::PPP, props::LCP_ECHO_FAILURE, 0).0,
                swap,
            ));
            payload
        }
        OPT_AUTH_PROTO => {
            let selector = match view.get_value(entities::PPP, props::AUTH_PROTOCOL, true) {
                Some(Value::List(protocols)) => {
                    let pap = protocols.iter().any(|name| name == "PAP");
                    let chap = protocols.iter().any(|name| name == "CHAP");
                    match (pap, chap) {
                        (true, true) => AUTH_PAPCHAP,
                        (true, false) => AUTH_PAP,
                        (false, true) => AUTH_CHAP,
                        (false, false) => AUTH_NONE,
                    }
                }
                _ => AUTH_NONE,
            };
            int_reply(selector)
        }
        OPT_AUTH_NAME => str_reply(view.get_str(entities::PPP, props::AUTH_NAME, "").0),
        OPT_IPCP_HDRCOMP => int_reply(view.get_int(entities::PPP, props::IPCP_COMPRESSION_VJ, 1).0),
        OPT_IPCP_LOCALADDR => int_reply(view.get_addr(entities::IPV4, props::ADDRESSES, 0).0),
        OPT_IPCP_REMOTEADDR => int_reply(view.get_addr(entities::IPV4, props::DEST_ADDRESSES, 0).0),
        OPT_ALERTENABLE => int_reply(view.get_int(entities::PPP, props::ALERT_ENABLE, 1).0),
        _ => return None,
    };

    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_precedence() {
        let mut state = OptionSet::new();
        let mut client = OptionSet::new();
        let mut setup = OptionSet::new();

        setup.set(entities::PPP, props::LCP_MRU, Value::Int(1000));
        client.set(entities::PPP, props::LCP_MRU, Value::Int(1400));
        state.set(entities::PPP, props::LCP_MRU, Value::Int(1492));

        let view = OptionView {
            state: Some(&state),
            client: Some(&client),
            setup: Some(&setup),
        };
        assert_eq!(
            view.get_int(entities::PPP, props::LCP_MRU, 1500),
            (1492, Tier::State)
        );

        // Session idle: no live state in the view
        let view = OptionView {
            state: None,
            client: Some(&client),
            setup: Some(&setup),
        };
        assert_eq!(
            view.get_int(entities::PPP, props::LCP_MRU, 1500),
            (1400, Tier::Client)
        );

        let view = OptionView {
            state: None,
            client: None,
            setup: Some(&setup),
        };
        assert_eq!(
            view.get_int(entities::PPP, props::LCP_MRU, 1500),
            (1000, Tier::Setup)
        );

        let view = OptionView::default();
        assert_eq!(
            view.get_int(entities::PPP, props::LCP_MRU, 1500),
            (1500, Tier::Default)
        );
    }

    #[test]
    fn test_set_serialize_parse_lookup_roundtrip() {
        let mut opts = OptionSet::new();
        opts.set(entities::PPP, props::AUTH_NAME, Value::Str("alice".into()));
        opts.set(entities::PPP, props::LCP_MRU, Value::Int(1492));
        opts.set(
            entities::PPP,
            props::AUTH_PROTOCOL,
            Value::List(vec!["PAP".into(), "CHAP".into()]),
        );

        let parsed = OptionSet::from_json(&opts.to_json()).unwrap();

        assert_eq!(parsed.str(entities::PPP, props::AUTH_NAME), Some("alice"));
        assert_eq!(parsed.int(entities::PPP, props::LCP_MRU), Some(1492));
        assert_eq!(
            parsed.list(entities::PPP, props::AUTH_PROTOCOL),
            Some(&["PAP".to_string(), "CHAP".to_string()][..])
        );
    }

    #[test]
    fn test_speed_ladder() {
        assert_eq!(snap_speed(0), 1200);
        assert_eq!(snap_speed(1200), 1200);
        assert_eq!(snap_speed(1201), 2400);
        assert_eq!(snap_speed(4800), 9600);
        assert_eq!(snap_speed(14400), 19200);
        assert_eq!(snap_speed(38400), 38400);
        assert_eq!(snap_speed(56000), 57600);
        assert_eq!(snap_speed(57601), 115_200);
        assert_eq!(snap_speed(u32::max_value()), 115_200);
    }

    #[test]
    fn test_set_option_speed_snaps() {
        let mut opts = OptionSet::new();
        let data = msg::write_u32_body(4800, false);

        set_option(&mut opts, OPT_DEV_SPEED, &data, false).unwrap();

        assert_eq!(opts.int(entities::MODEM, props::SPEED), Some(9600));
    }

    #[test]
    fn test_set_option_auth_proto_expands_to_list() {
        let mut opts = OptionSet::new();
        let data = msg::write_u32_body(AUTH_PAPCHAP, false);

        set_option(&mut opts, OPT_AUTH_PROTO, &data, false).unwrap();

        assert_eq!(
            opts.list(entities::PPP, props::AUTH_PROTOCOL),
            Some(&["PAP".to_string(), "CHAP".to_string()][..])
        );
    }

    #[test]
    fn test_set_option_unknown_id() {
        let mut opts = OptionSet::new();
        assert_eq!(
            set_option(&mut opts, 0xDEAD, &[], false),
            Err(msg::EOPNOTSUPP)
        );
    }

    #[test]
    fn test_set_then_get_roundtrip_through_protocol() {
        let mut opts = OptionSet::new();
        let data = msg::write_u32_body(1492, false);
        set_option(&mut opts, OPT_LCP_MRU, &data, false).unwrap();

        let view = OptionView {
            state: None,
            client: Some(&opts),
            setup: None,
        };
        let reply = get_option(&view, OPT_LCP_MRU, false).unwrap();

        assert_eq!(msg::read_u32_body(&reply, false), 1492);
    }

    #[test]
    fn test_get_option_swapped_integers() {
        let mut opts = OptionSet::new();
        opts.set(entities::PPP, props::LCP_MRU, Value::Int(0x0102_0304));

        let view = OptionView {
            state: None,
            client: Some(&opts),
            setup: None,
        };
        let reply = get_option(&view, OPT_LCP_MRU, true).unwrap();

        assert_eq!(msg::read_u32_body(&reply, true), 0x0102_0304);
    }

    #[test]
    fn test_addr_lookup_from_list_and_string() {
        let mut opts = OptionSet::new();
        opts.set(
            entities::IPV4,
            props::DEST_ADDRESSES,
            Value::List(vec!["10.0.1.2".into()]),
        );

        let view = OptionView {
            state: None,
            client: Some(&opts),
            setup: None,
        };
        assert_eq!(
            view.get_addr(entities::IPV4, props::DEST_ADDRESSES, 0),
            (0x0A00_0102, Tier::Client)
        );
    }

    #[test]
    fn test_parse_dotted_quad_rejects_garbage() {
        assert_eq!(parse_dotted_quad("10.0.1.2"), Some(0x0A00_0102));
        assert_eq!(parse_dotted_quad("256.0.0.1"), None);
        assert_eq!(parse_dotted_quad("10.0.1"), None);
        assert_eq!(parse_dotted_quad("10.0.1.2.3"), None);
        assert_eq!(parse_dotted_quad("not.an.ip.addr"), None);
    }

    #[test]
    fn test_bounded_string() {
        let long = "x".repeat(OPT_STR_LEN * 2);
        let mut opts = OptionSet::new();
        opts.set(entities::PPP, props::AUTH_NAME, Value::Str(long));

        let view = OptionView {
            state: None,
            client: Some(&opts),
            setup: None,
        };
        let (value, _) = view.get_str(entities::PPP, props::AUTH_NAME, "");
        assert_eq!(value.len(), OPT_STR_LEN);
    }

    #[test]
    fn test_ipcp_addr_set_formats_dotted_quad() {
        let mut opts = OptionSet::new();
        let data = msg::write_u32_body(0xC0A8_0001, false);

        set_option(&mut opts, OPT_IPCP_LOCALADDR, &data, false).unwrap();

        assert_eq!(
            opts.list(entities::IPV4, props::ADDRESSES),
            Some(&["192.168.0.1".to_string()][..])
        );
    }
}
