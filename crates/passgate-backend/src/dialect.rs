//! Backend URL dialects.
//!
//! Different backend generations expose the same three operations behind
//! different URL shapes. The dialect is a plain config string
//! (`url_fmt_suff`); unknown values fall through to the oldest
//! `checking.php` shape.

use passgate_core::{Config, LockerInfo, TagType, lockers};

/// Access-check path for a UID at a terminal.
#[must_use]
pub fn check_path(
    cfg: &Config,
    terminal_id: &str,
    uid: &str,
    tag_type: TagType,
    locker_list: &[LockerInfo],
    role: Option<&str>,
) -> String {
    let ident = &cfg.ident_path;
    match cfg.url_fmt_suff.as_str() {
        "wc1c" => {
            // <ident>/<term>/<uid>/<tagN>/0/0/<lockers>/0
            let lockers = lockers::format_digits(locker_list);
            format!(
                "{ident}/{terminal_id}/{uid}/{}/0/0/{lockers}/0",
                tag_type.as_num()
            )
        }
        "a&a" => format!("{ident}/verify/{terminal_id}/{uid}"),
        "1c_m" => format!(
            "{ident}/checkaccess?id={terminal_id}&uid={uid}&tagtype={}",
            tag_type.as_str()
        ),
        "1c_m_" => {
            let cells = lockers::format_pairs(locker_list, "0");
            format!("{ident}/checkaccess?id={terminal_id}&uid={uid}&cells={cells}")
        }
        "craft" => {
            let locks = lockers::format_pairs(locker_list, "");
            let role = role.unwrap_or("0");
            format!("/pass_request?id={terminal_id}&uid={uid}&role={role}&locks={locks}")
        }
        _ => {
            let lockers = lockers::format_digits(locker_list);
            format!("{ident}/checking.php?id={terminal_id}&uid={uid}&lockers={lockers}")
        }
    }
}

/// Pass-event (report) path.
#[must_use]
pub fn event_path(
    cfg: &Config,
    terminal_id: &str,
    uid: &str,
    granted: bool,
    tag_type: TagType,
    role: Option<&str>,
) -> String {
    let ident = &cfg.ident_path;
    match cfg.url_fmt_suff.as_str() {
        "wc1c" => {
            let reg = if granted { "1" } else { "0" };
            format!("{ident}/{terminal_id}/{uid}/{reg}/0/0/0/0")
        }
        "a&a" => format!("{ident}/check/{terminal_id}/{uid}"),
        "1c_m" => format!(
            "{ident}/event?id={terminal_id}&uid={uid}&tagtype={}",
            tag_type.as_str()
        ),
        "1c_m_" => format!("{ident}/event?id={terminal_id}&uid={uid}"),
        "craft" => {
            let role = role.unwrap_or("0");
            format!("/pass_register?id={terminal_id}&uid={uid}&role={role}")
        }
        _ => {
            let reg = if granted { "&reg=1" } else { "" };
            format!("{ident}/checking.php?id={terminal_id}&uid={uid}{reg}")
        }
    }
}

/// CID lookup path.
#[must_use]
pub fn uid_path(cfg: &Config, uid: &str) -> String {
    format!("{}/{uid}", cfg.uid_path)
}
