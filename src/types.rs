// src/types.rs
use serde::Serialize;
use std::fmt;

// 示波器输入通道
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Channel {
    A,
    B,
    C,
    D,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::A, Channel::B, Channel::C, Channel::D];

    pub fn index(self) -> usize {
        match self {
            Channel::A => 0,
            Channel::B => 1,
            Channel::C => 2,
            Channel::D => 3,
        }
    }

    pub fn letter(self) -> char {
        (b'A' + self.index() as u8) as char
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'A' => Some(Channel::A),
            'B' => Some(Channel::B),
            'C' => Some(Channel::C),
            'D' => Some(Channel::D),
            _ => None,
        }
    }

    /// Bit used for this channel in an enabled-channel mask (A=1, B=2, C=4, D=8).
    pub fn flag(self) -> u32 {
        1 << self.index()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

// 输入耦合方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum Coupling {
    Ac1M,
    #[default]
    Dc1M,
    Dc50,
}

impl Coupling {
    /// Termination seen by the signal, used to turn an integrated voltage into charge.
    pub fn resistance_ohms(self) -> f64 {
        match self {
            Coupling::Ac1M | Coupling::Dc1M => 1_000_000.0,
            Coupling::Dc50 => 50.0,
        }
    }

    /// Legacy numeric codes: 0 = AC 1MΩ, 1 = DC 1MΩ, 2 = DC 50Ω. Resistances are accepted too.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Coupling::Ac1M),
            1 | 1_000_000 => Some(Coupling::Dc1M),
            2 | 50 => Some(Coupling::Dc50),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let compact: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match compact.as_str() {
            "AC" | "AC1M" => Some(Coupling::Ac1M),
            "DC" | "DC1M" => Some(Coupling::Dc1M),
            "DC50" => Some(Coupling::Dc50),
            _ => None,
        }
    }
}

impl fmt::Display for Coupling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Coupling::Ac1M => "AC 1MΩ",
            Coupling::Dc1M => "DC 1MΩ",
            Coupling::Dc50 => "DC 50Ω",
        };
        f.write_str(label)
    }
}

// 带宽限制
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum Bandwidth {
    #[default]
    Full,
    Limited,
}

impl Bandwidth {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Bandwidth::Full),
            1 => Some(Bandwidth::Limited),
            _ => None,
        }
    }
}

// 数据文件格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum DataFormat {
    #[default]
    Txt,
    Csv,
}

impl DataFormat {
    pub fn separator(self) -> char {
        match self {
            DataFormat::Txt => '\t',
            DataFormat::Csv => ',',
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            DataFormat::Txt => "txt",
            DataFormat::Csv => "csv",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "txt" | "tsv" => Some(DataFormat::Txt),
            "csv" => Some(DataFormat::Csv),
            _ => None,
        }
    }
}

// 采集设备后端
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Simulated,
    PicoScope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_letters_round_trip() {
        for ch in Channel::ALL {
            assert_eq!(Channel::from_letter(ch.letter()), Some(ch));
        }
        assert_eq!(Channel::from_letter('c'), Some(Channel::C));
        assert_eq!(Channel::from_letter('E'), None);
    }

    #[test]
    fn channel_flags_match_device_mask() {
        let mask: u32 = Channel::ALL.iter().map(|c| c.flag()).sum();
        assert_eq!(mask, 0b1111);
        assert_eq!(Channel::C.flag(), 4);
    }

    #[test]
    fn coupling_accepts_codes_names_and_resistances() {
        assert_eq!(Coupling::from_code(2), Some(Coupling::Dc50));
        assert_eq!(Coupling::from_code(50), Some(Coupling::Dc50));
        assert_eq!(Coupling::from_name("DC 50Ω"), Some(Coupling::Dc50));
        assert_eq!(Coupling::from_name("ac"), Some(Coupling::Ac1M));
        assert_eq!(Coupling::Dc50.resistance_ohms(), 50.0);
    }
}
