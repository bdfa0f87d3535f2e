//! The OpenSSH known-hosts trust store: parsing, host matching (plain,
//! wildcard and hashed patterns), key classification and append-only
//! learning of new hosts.

use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use data_encoding::BASE64_MIME;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use sha1::Sha1;
use ssh_encoding::Decode;
use ssh_key::PublicKey;

use crate::Error;

/// What the trust store says about a server key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHostStatus {
    /// A matching entry with this key.
    Trusted,
    /// The host is on file with the same key type but a different key.
    Changed,
    /// A matching `@revoked` entry exists for this key type.
    Revoked,
    /// The host is not on file.
    Unknown,
}

/// The verdict a [`HostAuthentication`][crate::client::HostAuthentication]
/// callback returns. Only [`Trusted`][HostKeyDecision::Trusted] and
/// [`AddKnownHost`][HostKeyDecision::AddKnownHost] let the handshake
/// proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    Trusted,
    /// Trust this key and append it to the user known-hosts file.
    AddKnownHost,
    Revoked,
    Changed,
    Unknown,
}

/// The standard per-user location, `~/.ssh/known_hosts`.
pub fn user_known_hosts_path() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

/// The system-wide location consulted when
/// [`check_global_known_hosts`][crate::client::Config::check_global_known_hosts]
/// is set.
pub const GLOBAL_KNOWN_HOSTS_PATH: &str = "/etc/ssh/ssh_known_hosts";

#[derive(Debug, PartialEq, Eq)]
enum Marker {
    None,
    Revoked,
    CertAuthority,
}

struct Entry {
    marker: Marker,
    key: PublicKey,
}

/// Classify `key` for `host:port` against the user file (if any) and,
/// optionally, the global file.
pub fn classify(
    host: &str,
    port: u16,
    key: &PublicKey,
    user_path: Option<&Path>,
    check_global: bool,
) -> KnownHostStatus {
    let mut entries = Vec::new();
    if let Some(path) = user_path {
        entries.extend(matching_entries(host, port, path));
    }
    if check_global {
        entries.extend(matching_entries(host, port, Path::new(GLOBAL_KNOWN_HOSTS_PATH)));
    }

    let same_type = |e: &Entry| e.key.algorithm() == key.algorithm();

    if entries
        .iter()
        .any(|e| e.marker == Marker::Revoked && same_type(e))
    {
        return KnownHostStatus::Revoked;
    }
    // Certificate-authority entries are not plain key matches; skip them.
    let plain: Vec<&Entry> = entries
        .iter()
        .filter(|e| e.marker == Marker::None)
        .collect();
    if plain
        .iter()
        .any(|e| same_type(e) && e.key.key_data() != key.key_data())
    {
        return KnownHostStatus::Changed;
    }
    if plain
        .iter()
        .any(|e| same_type(e) && e.key.key_data() == key.key_data())
    {
        return KnownHostStatus::Trusted;
    }
    KnownHostStatus::Unknown
}

/// Every entry in `path` whose host pattern matches `host:port`. An
/// unreadable file counts as empty: a bogus path degrades to
/// trust-on-first-use rather than an error.
fn matching_entries(host: &str, port: u16, path: &Path) -> Vec<Entry> {
    let Ok(f) = File::open(path) else {
        return Vec::new();
    };
    let mut f = BufReader::new(f);
    let host_port = host_port_pattern(host, port);
    debug!("host_port = {host_port:?}");

    let mut entries = Vec::new();
    let mut buffer = String::new();
    loop {
        buffer.clear();
        match f.read_line(&mut buffer) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("unreadable known-hosts file {path:?}: {e}");
                return Vec::new();
            }
        }
        if let Some(entry) = parse_line(buffer.trim_end(), &host_port) {
            entries.push(entry);
        }
    }
    entries
}

fn host_port_pattern(host: &str, port: u16) -> Cow<'_, str> {
    if port == 22 {
        Cow::Borrowed(host)
    } else {
        Cow::Owned(format!("[{host}]:{port}"))
    }
}

fn parse_line(line: &str, host_port: &str) -> Option<Entry> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split_whitespace();
    let mut first = fields.next()?;

    let marker = if let Some(m) = first.strip_prefix('@') {
        let marker = match m {
            "revoked" => Marker::Revoked,
            "cert-authority" => Marker::CertAuthority,
            _ => return None,
        };
        first = fields.next()?;
        marker
    } else {
        Marker::None
    };

    let _key_type = fields.next()?;
    let key_b64 = fields.next()?;

    if !match_hostname(host_port, first) {
        return None;
    }

    let key = match parse_public_key_base64(key_b64) {
        Ok(key) => key,
        Err(e) => {
            debug!("skipping unparseable known-hosts key: {e}");
            return None;
        }
    };
    Some(Entry { marker, key })
}

/// Decode a known-hosts/authorized-keys style base64 key blob.
pub fn parse_public_key_base64(b64: &str) -> Result<PublicKey, Error> {
    let blob = BASE64_MIME
        .decode(b64.as_bytes())
        .map_err(|_| Error::MalformedPacket)?;
    let key = ssh_key::public::KeyData::decode(&mut &blob[..])?;
    Ok(PublicKey::from(key))
}

/// Match `host` (already in `[host]:port` form for non-default ports)
/// against a comma-separated pattern list. A matching negated pattern
/// vetoes the line; hashed `|1|salt|hash` entries use HMAC-SHA1.
fn match_hostname(host: &str, pattern: &str) -> bool {
    let mut matched = false;
    for entry in pattern.split(',') {
        if let Some(negated) = entry.strip_prefix('!') {
            if pattern_match(negated, host) {
                return false;
            }
        } else if entry.starts_with("|1|") {
            let mut parts = entry.split('|').skip(2);
            let Some(Ok(salt)) = parts.next().map(|p| BASE64_MIME.decode(p.as_bytes())) else {
                continue;
            };
            let Some(Ok(hash)) = parts.next().map(|p| BASE64_MIME.decode(p.as_bytes())) else {
                continue;
            };
            if let Ok(hmac) = Hmac::<Sha1>::new_from_slice(&salt) {
                if hmac.chain_update(host).verify_slice(&hash).is_ok() {
                    matched = true;
                }
            }
        } else if pattern_match(entry, host) {
            matched = true;
        }
    }
    matched
}

/// `*` and `?` glob matching over hostnames.
fn pattern_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.split_first(), t.split_first()) {
            (None, None) => true,
            (Some((b'*', rest_p)), _) => {
                inner(rest_p, t) || (!t.is_empty() && inner(p, t.get(1..).unwrap_or_default()))
            }
            (Some((b'?', rest_p)), Some((_, rest_t))) => inner(rest_p, rest_t),
            (Some((a, rest_p)), Some((b, rest_t))) => {
                a.eq_ignore_ascii_case(b) && inner(rest_p, rest_t)
            }
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

// known-hosts writes are append-only and serialized per process.
static LEARN_LOCK: Mutex<()> = Mutex::new(());

/// Record a host's public key into `path`, creating the file (and parent
/// directories) with user-only permissions as needed. Appending a key
/// already on file is a no-op.
pub fn learn(path: &Path, host: &str, port: u16, key: &PublicKey) -> Result<(), Error> {
    let _guard = LEARN_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    if classify(host, port, key, Some(path), false) == KnownHostStatus::Trusted {
        debug!("{host}:{port} already on file");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.read(true).append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    // Test whether the file ends with a newline before appending.
    let mut ends_in_newline = true;
    if file.seek(SeekFrom::End(-1)).is_ok() {
        let mut buf = [0; 1];
        file.read_exact(&mut buf)?;
        ends_in_newline = buf[0] == b'\n';
    }

    file.seek(SeekFrom::End(0))?;
    let mut line = String::new();
    if !ends_in_newline {
        line.push('\n');
    }
    line.push_str(&host_port_pattern(host, port));
    line.push(' ');
    line.push_str(&key.to_openssh()?);
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ED25519_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIJdD7y3aLq454yWBdwLWbieU1ebz9/cu7/QEXn9OIeZJ";
    const ED25519_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIA6rWI3G1sz07DnfFlrouTcysQlj2P+jpNSOEWD9OJ3X";
    const ED25519_HASHED: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAILIG2T/B0l0gaqj3puu510tu9N1OkQ4znY3LYuEm5zCF";

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "[localhost]:13265 ssh-ed25519 {ED25519_A}").unwrap();
        writeln!(f, "# a comment").unwrap();
        writeln!(f, "pijul.org,37.120.161.53 ssh-ed25519 {ED25519_B}").unwrap();
        writeln!(
            f,
            "|1|O33ESRMWPVkMYIwJ1Uw+n877jTo=|nuuC5vEqXlEZ/8BXQR7m619W6Ak= ssh-ed25519 {ED25519_HASHED}"
        )
        .unwrap();
        writeln!(f, "*.wild.example ssh-ed25519 {ED25519_A}").unwrap();
        writeln!(f, "!bad.example,*.example ssh-ed25519 {ED25519_A}").unwrap();
        writeln!(f, "@revoked oldhost.example ssh-ed25519 {ED25519_B}").unwrap();
        (dir, path)
    }

    #[test]
    fn trusted_on_nonstandard_port() {
        let (_dir, path) = fixture();
        let key = parse_public_key_base64(ED25519_A).unwrap();
        assert_eq!(
            classify("localhost", 13265, &key, Some(&path), false),
            KnownHostStatus::Trusted
        );
        // Same host, default port: the entry is for port 13265 only.
        assert_eq!(
            classify("localhost", 22, &key, Some(&path), false),
            KnownHostStatus::Unknown
        );
    }

    #[test]
    fn hashed_entries_match() {
        let (_dir, path) = fixture();
        let key = parse_public_key_base64(ED25519_HASHED).unwrap();
        assert_eq!(
            classify("example.com", 22, &key, Some(&path), false),
            KnownHostStatus::Trusted
        );
    }

    #[test]
    fn wildcard_and_negation() {
        let (_dir, path) = fixture();
        let key = parse_public_key_base64(ED25519_A).unwrap();
        assert_eq!(
            classify("a.wild.example", 22, &key, Some(&path), false),
            KnownHostStatus::Trusted
        );
        assert_eq!(
            classify("good.example", 22, &key, Some(&path), false),
            KnownHostStatus::Trusted
        );
        // The negated pattern vetoes its own line.
        assert_eq!(
            classify("bad.example", 22, &key, Some(&path), false),
            KnownHostStatus::Unknown
        );
    }

    #[test]
    fn changed_key_beats_trusted() {
        let (_dir, path) = fixture();
        let other = parse_public_key_base64(ED25519_A).unwrap();
        assert_eq!(
            classify("pijul.org", 22, &other, Some(&path), false),
            KnownHostStatus::Changed
        );
    }

    #[test]
    fn revoked_type_wins() {
        let (_dir, path) = fixture();
        // Any ed25519 key for a host with an @revoked ed25519 entry.
        let key = parse_public_key_base64(ED25519_A).unwrap();
        assert_eq!(
            classify("oldhost.example", 22, &key, Some(&path), false),
            KnownHostStatus::Revoked
        );
    }

    #[test]
    fn unreadable_file_is_unknown() {
        let key = parse_public_key_base64(ED25519_A).unwrap();
        assert_eq!(
            classify("localhost", 22, &key, Some(Path::new("/")), false),
            KnownHostStatus::Unknown
        );
    }

    #[test]
    fn learn_creates_parents_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep").join("nested").join("known_hosts");
        let key = parse_public_key_base64(ED25519_A).unwrap();

        learn(&path, "newhost.example", 2222, &key).unwrap();
        assert_eq!(
            classify("newhost.example", 2222, &key, Some(&path), false),
            KnownHostStatus::Trusted
        );
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.ends_with('\n'));
        assert!(first.starts_with("[newhost.example]:2222 ssh-ed25519 "));

        // Appending the same key again must not duplicate the line.
        learn(&path, "newhost.example", 2222, &key).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }
}
