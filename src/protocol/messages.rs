//! Wire text exchanged with chat clients
//!
//! Every server-originated line is plain UTF-8; the codec adds the `\n`.

/// Sent as soon as a client connects
pub const WELCOME: &str = "[Welcome to the chat server] Send your name!";

/// Sent once a display name has been accepted
pub const JOIN_PROMPT: &str = "Enter the room name to join or create a new room";

/// Client command that ends its own session
pub const EXIT_COMMAND: &str = "exit";

/// `Room list: a, b` or `Room list: None`
pub fn room_list(names: &[String]) -> String {
    if names.is_empty() {
        "Room list: None".to_string()
    } else {
        format!("Room list: {}", names.join(", "))
    }
}

/// A line tagged with the name of whoever it is attributed to
pub fn tagged(sender: &str, body: &str) -> String {
    format!("[{}] {}", sender, body)
}

pub fn joined_notice(name: &str) -> String {
    format!("{} joined.", name)
}

pub fn left_notice(name: &str) -> String {
    format!("{} left.", name)
}

/// A line received from a client, after normalisation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLine<'a> {
    /// Nothing but whitespace
    Empty,
    /// The literal `exit` command
    Exit,
    /// Anything else
    Text(&'a str),
}

impl<'a> ClientLine<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match raw.trim() {
            "" => ClientLine::Empty,
            EXIT_COMMAND => ClientLine::Exit,
            text => ClientLine::Text(text),
        }
    }
}
