//! TPL2 wire protocol definitions
//!
//! Handshake line parsing and outgoing request builders. Reply lines tagged
//! with a command id are handled by [`crate::reply`].

use crate::error::{TplError, TplResult};

/// First token of the server greeting
pub const TPL_GREETING_TAG: &str = "TPL2";

/// Line terminator for everything the client sends
pub const LINE_END: &str = "\r\n";

/// Suffix that asks for / announces the decode type of an object
pub const TYPE_SUFFIX: &str = "!TYPE";

/// Parsed server greeting:
/// `TPL2 <version> CONN <id> AUTH <method>[,<method>...] ENC MESSAGE <text>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub protocol_version: String,
    pub connection_id: u64,
    pub auth_methods: Vec<String>,
    pub message: String,
}

/// Parsed AUTH reply: `AUTH <status> <read_level> <write_level>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReply {
    pub status: String,
    pub read_level: Option<u8>,
    pub write_level: Option<u8>,
}

/// Split off the first whitespace-delimited token
pub(crate) fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], s[idx..].trim_start())),
        None => Some((s, "")),
    }
}

fn expect_keyword<'a>(rest: &'a str, keyword: &str, line: &str) -> TplResult<&'a str> {
    match next_token(rest) {
        Some((tok, rest)) if tok == keyword => Ok(rest),
        _ => Err(TplError::Protocol(format!(
            "Expected '{}' in greeting: {:?}",
            keyword, line
        ))),
    }
}

/// Parse the greeting line sent once by the server on connect
pub fn parse_greeting(line: &str) -> TplResult<Greeting> {
    let line = line.trim_end();
    let rest = expect_keyword(line, TPL_GREETING_TAG, line)?;

    let (protocol_version, rest) = next_token(rest)
        .ok_or_else(|| TplError::Protocol(format!("Missing protocol version: {:?}", line)))?;

    let rest = expect_keyword(rest, "CONN", line)?;
    let (conn, rest) = next_token(rest)
        .ok_or_else(|| TplError::Protocol(format!("Missing connection id: {:?}", line)))?;
    let connection_id = conn
        .parse::<u64>()
        .map_err(|_| TplError::Protocol(format!("Invalid connection id '{}'", conn)))?;

    let rest = expect_keyword(rest, "AUTH", line)?;
    let (methods, rest) = next_token(rest)
        .ok_or_else(|| TplError::Protocol(format!("Missing auth methods: {:?}", line)))?;
    let auth_methods = methods
        .split(',')
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();

    let rest = expect_keyword(rest, "ENC", line)?;
    let rest = expect_keyword(rest, "MESSAGE", line)?;

    Ok(Greeting {
        protocol_version: protocol_version.to_string(),
        connection_id,
        auth_methods,
        message: rest.trim().to_string(),
    })
}

/// Parse the single reply to `AUTH PLAIN`
///
/// Access levels are optional so that a terse rejection such as
/// `AUTH FAILED` is still reported as a rejection rather than a desync.
pub fn parse_auth_reply(line: &str) -> TplResult<AuthReply> {
    let line = line.trim_end();
    let rest = match next_token(line) {
        Some(("AUTH", rest)) => rest,
        _ => {
            return Err(TplError::Protocol(format!(
                "Expected AUTH reply, got {:?}",
                line
            )))
        }
    };
    let (status, rest) = next_token(rest)
        .ok_or_else(|| TplError::Protocol(format!("Empty AUTH reply: {:?}", line)))?;
    let mut levels = rest.split_whitespace().map(|l| l.parse::<u8>().ok());

    Ok(AuthReply {
        status: status.to_string(),
        read_level: levels.next().flatten(),
        write_level: levels.next().flatten(),
    })
}

/// `AUTH PLAIN "<user>" "<password>"`
pub fn auth_request(user: &str, password: &str) -> String {
    format!("AUTH PLAIN \"{}\" \"{}\"{}", user, password, LINE_END)
}

/// Compound GET asking for the type tag and the value in one round trip
pub fn get_request(id: u64, target: &str) -> String {
    format!("{} GET {}{};{}{}", id, target, TYPE_SUFFIX, target, LINE_END)
}

/// `<id> SET <target>=<value>`
pub fn set_request(id: u64, target: &str, value: &str) -> String {
    format!("{} SET {}={}{}", id, target, value, LINE_END)
}

/// Header for a binary SET; the raw payload follows it on the wire
pub fn set_binary_header(id: u64, target: &str, len: usize) -> String {
    format!("{} SET {}:{}{}", id, target, len, LINE_END)
}

/// Object paths read and written by the telescope, dome and focuser drivers
pub mod objects {
    // Server
    pub const SERVER_UPTIME: &str = "SERVER.UPTIME";
    pub const SERVER_INFO_DEVICE: &str = "SERVER.INFO.DEVICE";

    // Telescope state
    pub const TELESCOPE_READY: &str = "TELESCOPE.READY";
    pub const TELESCOPE_READY_STATE: &str = "TELESCOPE.READY_STATE";
    pub const TELESCOPE_MOTION_STATE: &str = "TELESCOPE.MOTION_STATE";
    pub const TELESCOPE_STATUS_GLOBAL: &str = "TELESCOPE.STATUS.GLOBAL";
    pub const TELESCOPE_STATUS_LIST: &str = "TELESCOPE.STATUS.LIST";
    pub const TELESCOPE_STATUS_CLEAR: &str = "TELESCOPE.STATUS.CLEAR";
    pub const TELESCOPE_STOP: &str = "TELESCOPE.STOP";

    // Pointing
    pub const POINTING_TRACK: &str = "POINTING.TRACK";
    pub const POINTING_SLEWTIME: &str = "POINTING.SLEWTIME";
    pub const POINTING_SETUP_DOME_SYNCMODE: &str = "POINTING.SETUP.DOME.SYNCMODE";
    pub const POINTING_SETUP_LATITUDE: &str = "POINTING.SETUP.LOCAL.LATITUDE";
    pub const POINTING_SETUP_LONGITUDE: &str = "POINTING.SETUP.LOCAL.LONGITUDE";

    // Target object
    pub const OBJECT_EQUATORIAL_RA: &str = "OBJECT.EQUATORIAL.RA";
    pub const OBJECT_EQUATORIAL_DEC: &str = "OBJECT.EQUATORIAL.DEC";
    pub const OBJECT_HORIZONTAL_ALT: &str = "OBJECT.HORIZONTAL.ALT";
    pub const OBJECT_HORIZONTAL_AZ: &str = "OBJECT.HORIZONTAL.AZ";

    // Current position
    pub const POSITION_RA_J2000: &str = "POSITION.EQUATORIAL.RA_J2000";
    pub const POSITION_DEC_J2000: &str = "POSITION.EQUATORIAL.DEC_J2000";
    pub const POSITION_ALT: &str = "POSITION.HORIZONTAL.ALT";
    pub const POSITION_AZ: &str = "POSITION.HORIZONTAL.AZ";
    pub const POSITION_LOCAL_UTC: &str = "POSITION.LOCAL.UTC";
    pub const POSITION_SIDEREAL_TIME: &str = "POSITION.LOCAL.SIDEREAL_TIME";

    // Dome
    pub const DOME_POSITION: &str = "POSITION.HORIZONTAL.DOME";
    pub const DOME_TARGETPOS: &str = "POSITION.INSTRUMENTAL.DOME[0].TARGETPOS";
    pub const DOME_CURRPOS: &str = "POSITION.INSTRUMENTAL.DOME[0].CURRPOS";
    pub const DOME_OFFSET: &str = "POSITION.INSTRUMENTAL.DOME[0].OFFSET";
    pub const DOME_SLIT_REALPOS: &str = "AUXILIARY.DOME.REALPOS";
    pub const DOME_SLIT_TARGETPOS: &str = "AUXILIARY.DOME.TARGETPOS";

    // Mirror cover
    pub const COVER_REALPOS: &str = "AUXILIARY.COVER.REALPOS";
    pub const COVER_TARGETPOS: &str = "AUXILIARY.COVER.TARGETPOS";

    // Single-axis focuser
    pub const FOCUS_REALPOS: &str = "POSITION.INSTRUMENTAL.FOCUS.REALPOS";
    pub const FOCUS_OFFSET: &str = "POSITION.INSTRUMENTAL.FOCUS.OFFSET";
    pub const FOCUS_STEP: &str = "POSITION.INSTRUMENTAL.FOCUS.STEP";

    /// Path of a hexapod focus axis leaf, e.g. `POSITION.INSTRUMENTAL.FOCUS[2].REALPOS`
    pub fn focus_axis(axis: usize, leaf: &str) -> String {
        format!("POSITION.INSTRUMENTAL.FOCUS[{}].{}", axis, leaf)
    }
}
