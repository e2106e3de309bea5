#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum Command {
    Open = 0,
    Close = 1,
    Data = 2,
    Unknown = 255,
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0 => Command::Open,
            1 => Command::Close,
            2 => Command::Data,
            _ => Command::Unknown,
        }
    }
}

impl From<Command> for u8 {
    fn from(value: Command) -> Self {
        value as u8
    }
}
