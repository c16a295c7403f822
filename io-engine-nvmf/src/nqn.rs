//! NQN grammar validation (spec §3 Host, §6.5).
//!
//! Mirrors the validation teacher performs before `spdk_nvmf_subsystem_add_host`
//! / `spdk_nvmf_tgt_find_subsystem` (`nvmf_subsystem.c` in the original
//! sources rejects malformed NQNs at the same three boundaries: length,
//! the discovery NQN literal, and the two `nqn.` grammars).

use snafu::Snafu;

/// Minimum accepted NQN length, per `SPDK_NVMF_NQN_MIN_LEN`.
pub const NQN_MIN_LEN: usize = 11;
pub const NQN_MAX_LEN: usize = 223;

pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("NQN invalid at byte offset {position}: {reason}"))]
    InvalidNqn { position: usize, reason: &'static str },
}

/// Validate an NQN per §3/§6.5, returning the offending byte offset on
/// failure as required by §6.5.
pub fn validate(nqn: &str) -> Result<(), Error> {
    if nqn.len() < NQN_MIN_LEN || nqn.len() > NQN_MAX_LEN {
        return Err(Error::InvalidNqn {
            position: 0,
            reason: "length out of [NQN_MIN_LEN, 223]",
        });
    }

    if nqn == DISCOVERY_NQN {
        return Ok(());
    }

    if let Some(rest) = nqn.strip_prefix("nqn.2014-08.org.nvmexpress:uuid:") {
        return uuid::Uuid::parse_str(rest).map(|_| ()).map_err(|_| {
            Error::InvalidNqn {
                position: "nqn.2014-08.org.nvmexpress:uuid:".len(),
                reason: "malformed UUID suffix",
            }
        });
    }

    validate_date_domain_form(nqn)
}

/// `nqn.<yyyy>-<mm>.<reverse-domain>:<user>`
fn validate_date_domain_form(nqn: &str) -> Result<(), Error> {
    let rest = nqn.strip_prefix("nqn.").ok_or(Error::InvalidNqn {
        position: 0,
        reason: "missing 'nqn.' prefix",
    })?;
    let prefix_len = "nqn.".len();

    let (date, after_date) = rest.split_at(rest.find('.').ok_or(Error::InvalidNqn {
        position: prefix_len,
        reason: "missing '.' after yyyy-mm",
    })?);
    if date.len() != 7 || date.as_bytes()[4] != b'-' {
        return Err(Error::InvalidNqn {
            position: prefix_len,
            reason: "date must be yyyy-mm",
        });
    }
    if !date[0..4].bytes().all(|b| b.is_ascii_digit())
        || !date[5..7].bytes().all(|b| b.is_ascii_digit())
    {
        return Err(Error::InvalidNqn {
            position: prefix_len,
            reason: "non-digit in yyyy-mm",
        });
    }

    let after_date = &after_date[1..]; // strip the '.'
    let domain_start = prefix_len + date.len() + 1;

    let colon = after_date.find(':').ok_or(Error::InvalidNqn {
        position: domain_start,
        reason: "missing ':' before user string",
    })?;
    let (domain, user) = after_date.split_at(colon);
    let user = &user[1..]; // strip ':'

    if domain.is_empty() {
        return Err(Error::InvalidNqn {
            position: domain_start,
            reason: "empty reverse-domain",
        });
    }
    for (i, label) in domain.split('.').enumerate() {
        if !is_rfc1034_label(label) {
            let offset = domain_start
                + domain
                    .split('.')
                    .take(i)
                    .map(|l| l.len() + 1)
                    .sum::<usize>();
            return Err(Error::InvalidNqn {
                position: offset,
                reason: "domain label is not a valid RFC-1034 label",
            });
        }
    }

    if user.is_empty() {
        return Err(Error::InvalidNqn {
            position: domain_start + domain.len() + 1,
            reason: "empty user string",
        });
    }
    // User part just needs to be valid UTF-8, which it already is as a
    // Rust `&str`.

    Ok(())
}

fn is_rfc1034_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    if !bytes[0].is_ascii_alphabetic() {
        return false;
    }
    if !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }
    bytes.iter().all(|&b| b.is_ascii_alphanumeric() || b == b'-')
}
