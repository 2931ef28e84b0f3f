//! Event script parsing
//!
//! Scripts drive the dispatcher from a file or stdin, one command per line:
//!
//! ```text
//! # host interfaces in enumeration order
//! interfaces eth0 wlan0
//! start
//! link arc0 up
//! default wlan0
//! wait 50
//! show
//! ```

use crate::device::types::IFNAME_MAX_LEN;
use crate::dispatcher::Event;
use crate::error::{Error, Result};
use crate::guest::{GuestEvent, GuestMessage, GuestType};
use crate::network::netlink::{IFF_UP, LinkMessage, LinkMessageKind};
use nom::{
    Parser,
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::space1,
    combinator::{map, value},
    multi::many0,
    sequence::preceded,
};
use std::time::Duration;

/// A single script command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Replace the host interface list
    Interfaces(Vec<String>),
    /// Change the host default interface
    Default(String),
    /// Guest started
    Start,
    /// Guest stopped
    Stop,
    /// Guest-side link notification
    Link { ifname: String, up: bool },
    /// Guest reports a device added
    Added(String),
    /// Guest reports a device removed
    Removed(String),
    /// Print the device table
    Show,
    /// Pause before the next command
    Wait(Duration),
}

impl Command {
    /// Dispatcher event for this command
    ///
    /// `Show` and `Wait` are run by the script driver and map to `None`.
    pub fn into_event(self, guest_type: GuestType) -> Option<Event> {
        let guest = |event| GuestMessage::new(guest_type, event);

        match self {
            Command::Interfaces(ifnames) => Some(Event::InterfaceListChanged(ifnames)),
            Command::Default(ifname) => Some(Event::DefaultInterfaceChanged(ifname)),
            Command::Start => Some(Event::Guest(GuestMessage::start(guest_type))),
            Command::Stop => Some(Event::Guest(GuestMessage::stop(guest_type))),
            Command::Link { ifname, up } => {
                let flags = if up { IFF_UP } else { 0 };
                Some(Event::LinkMessage {
                    guest_type,
                    bytes: LinkMessage::new(LinkMessageKind::New, 0, ifname, flags).encode(),
                })
            }
            Command::Added(ifname) => Some(Event::Guest(
                guest(GuestEvent::DeviceAdded).with_ifname(ifname),
            )),
            Command::Removed(ifname) => Some(Event::Guest(
                guest(GuestEvent::DeviceRemoved).with_ifname(ifname),
            )),
            Command::Show | Command::Wait(_) => None,
        }
    }

    /// Interface names the command refers to
    fn ifnames(&self) -> Vec<&str> {
        match self {
            Command::Interfaces(ifnames) => ifnames.iter().map(String::as_str).collect(),
            Command::Default(ifname)
            | Command::Added(ifname)
            | Command::Removed(ifname)
            | Command::Link { ifname, .. } => vec![ifname.as_str()],
            Command::Start | Command::Stop | Command::Show | Command::Wait(_) => Vec::new(),
        }
    }
}

/// Parse a whole script
pub fn parse_script(content: &str) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if let Some(command) = parse_line(line, index + 1)? {
            commands.push(command);
        }
    }
    Ok(commands)
}

/// Parse one line; blank lines and comments yield `None`
pub fn parse_line(line: &str, number: usize) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let result = alt((
        parse_interfaces,
        parse_default,
        parse_link,
        parse_added,
        parse_removed,
        parse_wait,
        value(Command::Start, tag_no_case("start")),
        value(Command::Stop, tag_no_case("stop")),
        value(Command::Show, tag_no_case("show")),
    ))
    .parse(line);

    match result {
        Ok(("", command)) => {
            if let Some(name) = command.ifnames().into_iter().find(|n| n.len() > IFNAME_MAX_LEN) {
                return Err(Error::ScriptParse {
                    line: number,
                    message: format!("Interface name too long: {}", name),
                });
            }
            Ok(Some(command))
        }
        Ok((trailing, _)) => Err(Error::ScriptParse {
            line: number,
            message: format!("Unexpected input: {}", trailing.trim()),
        }),
        Err(_) => Err(Error::ScriptParse {
            line: number,
            message: format!("Unknown command: {}", line),
        }),
    }
}

// Nom parsers for each command

fn ifname(input: &str) -> nom::IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace()).parse(input)
}

fn argument<'a>(
    keyword: &'static str,
) -> impl Parser<&'a str, Output = &'a str, Error = nom::error::Error<&'a str>> {
    preceded((tag_no_case(keyword), space1), ifname)
}

fn parse_interfaces(input: &str) -> nom::IResult<&str, Command> {
    let (input, _) = tag_no_case("interfaces").parse(input)?;
    let (input, names) = many0(preceded(space1, ifname)).parse(input)?;

    Ok((
        input,
        Command::Interfaces(names.into_iter().map(str::to_string).collect()),
    ))
}

fn parse_default(input: &str) -> nom::IResult<&str, Command> {
    map(argument("default"), |name| Command::Default(name.to_string())).parse(input)
}

fn parse_added(input: &str) -> nom::IResult<&str, Command> {
    map(argument("added"), |name| Command::Added(name.to_string())).parse(input)
}

fn parse_removed(input: &str) -> nom::IResult<&str, Command> {
    map(argument("removed"), |name| Command::Removed(name.to_string())).parse(input)
}

fn parse_link(input: &str) -> nom::IResult<&str, Command> {
    let (input, name) = argument("link").parse(input)?;
    let (input, _) = space1.parse(input)?;
    let (input, up) = alt((
        value(true, tag_no_case("up")),
        value(false, tag_no_case("down")),
    ))
    .parse(input)?;

    Ok((
        input,
        Command::Link {
            ifname: name.to_string(),
            up,
        },
    ))
}

fn parse_wait(input: &str) -> nom::IResult<&str, Command> {
    let (input, ms) = preceded((tag_no_case("wait"), space1), nom::character::complete::u64)
        .parse(input)?;
    Ok((input, Command::Wait(Duration::from_millis(ms))))
}
