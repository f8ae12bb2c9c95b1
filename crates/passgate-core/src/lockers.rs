//! Locker-cell data returned by POCKET-family readers.
//!
//! A reader reports every locker cell currently bound to a card. Each cell
//! is either a numbered block (`block_no`) or a Passtech block addressed by
//! letter (`A`-`Z`). The same structure is produced from the JSP flat
//! string form `"block:cab,block:cab,..."`.

use serde::{Deserialize, Serialize};

/// One locker cell bound to a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockerInfo {
    /// Authentication error nibble (0 = ok)
    pub auth_err: u8,
    /// Read error nibble (0 = ok)
    pub read_err: u8,
    pub is_passtech: bool,
    pub block_no: u8,
    /// Letter for Passtech blocks 1-26, '-' otherwise
    pub litera: char,
    pub locked: bool,
    /// Cabinet number, 15 bits
    pub cab_no: u16,
}

impl LockerInfo {
    /// Passtech block letter for `block_no` 1-26, '-' otherwise.
    #[must_use]
    pub fn block_letter(block_no: u8) -> char {
        if (1..=26).contains(&block_no) {
            (b'A' + block_no - 1) as char
        } else {
            '-'
        }
    }

    /// A clean numbered cell, as parsed from the JSP string form.
    #[must_use]
    pub fn numbered(block_no: u8, cab_no: u16) -> Self {
        LockerInfo {
            auth_err: 0,
            read_err: 0,
            is_passtech: false,
            block_no,
            litera: '-',
            locked: true,
            cab_no,
        }
    }

    /// A clean Passtech cell addressed by letter.
    #[must_use]
    pub fn passtech(litera: char, cab_no: u16) -> Self {
        let block_no = if litera.is_ascii_uppercase() {
            litera as u8 - b'A' + 1
        } else {
            0
        };
        LockerInfo {
            auth_err: 0,
            read_err: 0,
            is_passtech: true,
            block_no,
            litera,
            locked: true,
            cab_no,
        }
    }

    /// A cell counts toward backend parameters and deny messages only when
    /// it read cleanly and is still locked.
    #[must_use]
    pub fn usable(&self) -> bool {
        self.auth_err == 0 && self.read_err == 0 && self.locked && self.cab_no > 0
    }

    /// Block token as it appears in `block:cab` pairs.
    #[must_use]
    pub fn block_token(&self) -> String {
        if self.is_passtech {
            self.litera.to_string()
        } else {
            self.block_no.to_string()
        }
    }

    /// Display label for terminal messages: `A27` for Passtech, the bare
    /// cabinet number otherwise.
    #[must_use]
    pub fn label(&self) -> String {
        if self.is_passtech {
            format!("{}{}", self.litera, self.cab_no)
        } else {
            self.cab_no.to_string()
        }
    }
}

/// Parse the flat string form `"62:180,A:27;33"` into structured cells.
///
/// Tokens are separated by `,` or `;`. A token is `block:cab` or a bare
/// cabinet number. A single upper-case `A`-`Z` block token means Passtech;
/// any other block token (including a single digit) is a numeric block.
/// `-` as a block token is Passtech with no block letter. Unparseable
/// tokens are skipped.
#[must_use]
pub fn parse_list(s: &str) -> Vec<LockerInfo> {
    let mut result = Vec::new();

    for token in s.split([',', ';']) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let (block, cab) = match token.split_once(':') {
            Some((b, c)) => (b.trim(), c.trim()),
            None => ("", token),
        };

        let Ok(cab_no) = cab.parse::<u16>() else {
            continue;
        };

        let info = if block.is_empty() {
            LockerInfo::numbered(0, cab_no)
        } else if block == "-" {
            let mut l = LockerInfo::passtech('-', cab_no);
            l.block_no = 0;
            l
        } else if block.len() == 1 && block.as_bytes()[0].is_ascii_uppercase() {
            LockerInfo::passtech(block.chars().next().unwrap(), cab_no)
        } else if let Ok(block_no) = block.parse::<u8>() {
            LockerInfo::numbered(block_no, cab_no)
        } else {
            continue;
        };
        result.push(info);
    }

    result
}

/// Digits-only comma list of usable cabinet numbers, `"0"` when empty.
/// Used by the `wc1c` and default backend dialects.
#[must_use]
pub fn format_digits(lockers: &[LockerInfo]) -> String {
    let items: Vec<String> = lockers
        .iter()
        .filter(|l| l.usable())
        .map(|l| l.cab_no.to_string())
        .collect();
    if items.is_empty() {
        "0".to_string()
    } else {
        items.join(",")
    }
}

/// `block:cab` comma list of usable cells; `empty` is returned when there
/// is nothing to report (`"0"` for `1c_m_`, `""` for `craft`).
#[must_use]
pub fn format_pairs(lockers: &[LockerInfo], empty: &str) -> String {
    let items: Vec<String> = lockers
        .iter()
        .filter(|l| l.usable())
        .map(|l| format!("{}:{}", l.block_token(), l.cab_no))
        .collect();
    if items.is_empty() {
        empty.to_string()
    } else {
        items.join(",")
    }
}

/// Display labels of usable cells for terminal deny messages.
#[must_use]
pub fn display_labels(lockers: &[LockerInfo]) -> Vec<String> {
    lockers
        .iter()
        .filter(|l| l.usable())
        .map(LockerInfo::label)
        .collect()
}
