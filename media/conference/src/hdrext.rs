//! RTP header extension negotiation (RFC 5285)
//!
//! Extensions are matched by URI. Ids in `1..=255` are assigned, anything above marks an extension which still
//! needs an id. Negotiation runs alongside the codec negotiation and shares a set of used ids between its phases.

use crate::stream::Direction;

/// Extensions with an id at or above this value have no id assigned
pub const UNASSIGNED_ID: u16 = 256;

/// RTT & send timestamp extension carrying the TFRC sender state
pub const RTT_SENDTS_URI: &str = "urn:ietf:params:rtp-hdrext:rtt-sendts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeaderExtension {
    pub id: u16,
    pub uri: String,
    pub direction: Direction,
}

impl RtpHeaderExtension {
    pub fn new(id: u16, uri: impl Into<String>, direction: Direction) -> Self {
        Self {
            id,
            uri: uri.into(),
            direction,
        }
    }

    pub fn is_assigned(&self) -> bool {
        (1..UNASSIGNED_ID).contains(&self.id)
    }

    fn uri_matches(&self, uri: &str) -> bool {
        self.uri.eq_ignore_ascii_case(uri)
    }
}

/// Set of extension ids in use
#[derive(Debug, Default, Clone)]
pub(crate) struct UsedIds([u64; 4]);

impl UsedIds {
    fn mark(&mut self, id: u16) {
        if id < UNASSIGNED_ID {
            self.0[usize::from(id / 64)] |= 1 << (id % 64);
        }
    }

    fn contains(&self, id: u16) -> bool {
        id < UNASSIGNED_ID && self.0[usize::from(id / 64)] & (1 << (id % 64)) != 0
    }
}

/// Build the local extensions from the preferences, keeping ids of previously negotiated extensions
pub(crate) fn create_local_header_extensions(
    old: &[RtpHeaderExtension],
    preferences: &[RtpHeaderExtension],
    used: &mut UsedIds,
) -> Vec<RtpHeaderExtension> {
    let mut extensions = preferences.to_vec();

    for ext in &mut extensions {
        let existing = old.iter().find(|old| old.uri_matches(&ext.uri));

        if let Some(existing) = existing
            && existing.is_assigned()
            && !preferences.iter().any(|pref| pref.id == existing.id)
        {
            ext.id = existing.id;
        }
    }

    for ext in &extensions {
        used.mark(ext.id);
    }

    extensions
}

/// Intersect the local extensions with the ones of a remote stream
///
/// Extensions the remote doesn't know are dropped, the direction is the intersection of both. With `favor_remote`
/// all local extensions sharing the id of a matched one take the remote's id.
pub(crate) fn negotiate_stream_header_extensions(
    mut extensions: Vec<RtpHeaderExtension>,
    remote: &[RtpHeaderExtension],
    favor_remote: bool,
    used: &mut UsedIds,
) -> Vec<RtpHeaderExtension> {
    if extensions.is_empty() {
        return extensions;
    }

    for ext in remote {
        used.mark(ext.id);
    }

    let mut i = 0;

    while i < extensions.len() {
        let Some(remote_ext) = remote.iter().find(|r| r.uri_matches(&extensions[i].uri)) else {
            extensions.remove(i);
            continue;
        };

        extensions[i].direction &= remote_ext.direction;

        // Duplicates are preserved, users pick the one they prefer
        if favor_remote {
            let old_id = extensions[i].id;

            for ext in extensions.iter_mut().filter(|ext| ext.id == old_id) {
                ext.id = remote_ext.id;
            }
        }

        i += 1;
    }

    extensions
}

/// Assign the lowest free ids to extensions which have none
///
/// Extensions for which no id is left are dropped.
pub(crate) fn finish_header_extensions_nego(
    mut extensions: Vec<RtpHeaderExtension>,
    used: &mut UsedIds,
) -> Vec<RtpHeaderExtension> {
    let mut next_free = 1;
    let mut i = 0;

    while i < extensions.len() {
        if extensions[i].id < UNASSIGNED_ID {
            i += 1;
            continue;
        }

        while next_free < UNASSIGNED_ID && used.contains(next_free) {
            next_free += 1;
        }

        if next_free >= UNASSIGNED_ID {
            log::debug!("No header extension id left for {}", extensions[i].uri);
            extensions.remove(i);
            continue;
        }

        let unassigned_id = extensions[i].id;
        let uri = extensions[i].uri.clone();

        extensions[i].id = next_free;
        used.mark(next_free);
        next_free += 1;

        let mut j = i + 1;
        while j < extensions.len() {
            if extensions[j].id == unassigned_id && extensions[j].uri_matches(&uri) {
                extensions.remove(j);
            } else {
                j += 1;
            }
        }

        i += 1;
    }

    extensions
}
