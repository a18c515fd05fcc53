#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    UdpAssociate = 0x03,
    /// UDP-over-TCP extension: datagrams are framed on the request's own TCP stream.
    UdpTunnel = 0xF3,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Command::Connect),
            0x03 => Some(Command::UdpAssociate),
            0xF3 => Some(Command::UdpTunnel),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}
