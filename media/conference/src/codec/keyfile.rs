//! Load codec lists from key files
//!
//! ```text
//! [audio/PCMU]
//! id=0
//! clock-rate=8000
//!
//! [video/H264:high]
//! clock-rate=90000
//! profile-level-id=64001f
//! feedback:nack/pli=
//! ```
//!
//! Each group describes one codec as `media-type/ENCODING-NAME`, anything after a `:` only serves to make the group
//! name unique. The keys `id`, `clock-rate`, `channels` and `trr-int` set the respective fields, keys starting with
//! `feedback:` add a feedback parameter, every other key becomes an optional parameter. Groups with an invalid name
//! and keys with invalid values are skipped.

use super::{Codec, ID_ANY, ID_DISABLE, MediaType};
use crate::Error;
use nom::{
    IResult,
    branch::alt,
    bytes::complete::take_till1,
    character::complete::char,
    combinator::{all_consuming, map, rest},
    sequence::{delimited, separated_pair},
};
use std::{fs, path::Path};

enum Line<'i> {
    Group(&'i str),
    Entry(&'i str, &'i str),
}

fn group(i: &str) -> IResult<&str, Line<'_>> {
    map(
        delimited(char('['), take_till1(|c| c == ']'), char(']')),
        Line::Group,
    )(i)
}

fn entry(i: &str) -> IResult<&str, Line<'_>> {
    map(
        separated_pair(take_till1(|c| c == '='), char('='), rest),
        |(key, value): (&str, &str)| Line::Entry(key.trim(), value.trim()),
    )(i)
}

/// Read a codec list from the key file at `path`
pub fn codecs_from_keyfile(path: impl AsRef<Path>) -> Result<Vec<Codec>, Error> {
    let path = path.as_ref();

    let contents = fs::read_to_string(path).map_err(|e| {
        Error::InvalidArguments(format!("failed to read {}: {e}", path.display()))
    })?;

    parse_codecs(&contents)
}

/// Parse a codec list from the contents of a key file
pub fn parse_codecs(contents: &str) -> Result<Vec<Codec>, Error> {
    let mut codecs = Vec::new();
    let mut current: Option<Option<Codec>> = None;

    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let (_, parsed) = all_consuming(alt((group, entry)))(line).map_err(|_| {
            Error::InvalidArguments(format!("invalid key file syntax in line {}", number + 1))
        })?;

        match parsed {
            Line::Group(name) => {
                if let Some(Some(codec)) = current.take() {
                    codecs.push(codec);
                }

                current = Some(codec_from_group_name(name));
            }
            Line::Entry(key, value) => match &mut current {
                None => {
                    return Err(Error::InvalidArguments(format!(
                        "key {key} in line {} is not inside a group",
                        number + 1
                    )));
                }
                // Group was rejected, ignore its keys
                Some(None) => {}
                Some(Some(codec)) => apply_key(codec, key, value),
            },
        }
    }

    if let Some(Some(codec)) = current {
        codecs.push(codec);
    }

    Ok(codecs)
}

fn codec_from_group_name(group: &str) -> Option<Codec> {
    let Some((media_type, encoding_name)) = group.split_once('/') else {
        log::warn!("Invalid codec name: {group}");
        return None;
    };

    let Ok(media_type) = media_type.parse::<MediaType>() else {
        log::warn!("Invalid media type in codec name {group}");
        return None;
    };

    let encoding_name = encoding_name
        .split_once(':')
        .map_or(encoding_name, |(name, _)| name);

    if encoding_name.is_empty() {
        log::warn!("Empty encoding name in codec name {group}");
        return None;
    }

    Some(Codec::new(ID_ANY, encoding_name.to_owned(), media_type, 0))
}

fn apply_key(codec: &mut Codec, key: &str, value: &str) {
    if key.eq_ignore_ascii_case("clock-rate") {
        match value.parse() {
            Ok(clock_rate) => codec.clock_rate = clock_rate,
            Err(_) => warn_invalid(codec, key, value),
        }
    } else if key.eq_ignore_ascii_case("id") {
        match value.parse::<i32>() {
            Ok(id) if id < 0 => codec.id = ID_DISABLE,
            Ok(id) => codec.id = id,
            Err(_) => warn_invalid(codec, key, value),
        }
    } else if key.eq_ignore_ascii_case("channels") {
        match value.parse() {
            Ok(channels) => codec.channels = channels,
            Err(_) => warn_invalid(codec, key, value),
        }
    } else if key.eq_ignore_ascii_case("trr-int") {
        match value.parse() {
            Ok(interval) => codec.minimum_reporting_interval = Some(interval),
            Err(_) => warn_invalid(codec, key, value),
        }
    } else if let Some(feedback) = key.strip_prefix("feedback:") {
        let (type_, subtype) = feedback.split_once('/').unwrap_or((feedback, ""));

        codec.add_feedback(type_, subtype, value);
    } else {
        codec.add_param(key, value);
    }
}

fn warn_invalid(codec: &Codec, key: &str, value: &str) {
    log::warn!(
        "Error reading key {key} of codec {}: invalid value {value:?}",
        codec.encoding_name
    );
}
