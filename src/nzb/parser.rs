use std::collections::HashMap;
use std::io::BufRead;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use regex::Regex;
use tracing::debug;

use crate::nzb::error::NzbError;
use crate::nzb::types::*;

pub struct NzbParser;

impl NzbParser {
    pub fn parse<R: BufRead>(reader: R) -> Result<Nzb, NzbError> {
        let mut xml_reader = Reader::from_reader(reader);
        xml_reader.config_mut().trim_text(true);

        let mut nzb = Nzb::new();
        let mut buf = Vec::new();
        let mut current_file: Option<NzbFile> = None;
        let mut current_segment: Option<NzbSegment> = None;
        let mut current_groups: Vec<String> = Vec::new();
        let mut current_meta: Option<String> = None;
        let mut in_head = false;
        let mut in_group = false;

        loop {
            match xml_reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => match e.name() {
                    QName(b"head") => in_head = true,
                    QName(b"meta") if in_head => {
                        current_meta = meta_type(e)?;
                    }
                    QName(b"file") => {
                        current_file = Some(parse_file_start(e)?);
                        current_groups.clear();
                    }
                    QName(b"group") => in_group = true,
                    QName(b"segment") => {
                        current_segment = Some(parse_segment_start(e)?);
                    }
                    _ => {}
                },
                Ok(Event::End(ref e)) => match e.name() {
                    QName(b"head") => in_head = false,
                    QName(b"meta") => current_meta = None,
                    QName(b"group") => in_group = false,
                    QName(b"file") => {
                        if let Some(mut file) = current_file.take() {
                            file.groups = std::mem::take(&mut current_groups);
                            file.finish_segments();
                            if file.path.is_empty() {
                                file.path = filename_from_subject(&file.subject);
                            }
                            nzb.files.push(file);
                        }
                    }
                    QName(b"segment") => {
                        if let (Some(segment), Some(file)) =
                            (current_segment.take(), current_file.as_mut())
                        {
                            file.add_segment(segment);
                        }
                    }
                    _ => {}
                },
                Ok(Event::Text(e)) => {
                    let text = e
                        .unescape()
                        .map_err(|e| NzbError::Parse(e.to_string()))?
                        .trim()
                        .to_string();

                    if let Some(segment) = current_segment.as_mut() {
                        segment.message_id = text;
                    } else if in_group && !text.is_empty() {
                        current_groups.push(text);
                    } else if let Some(key) = current_meta.as_ref() {
                        nzb.meta.attributes.insert(key.clone(), text);
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(NzbError::Parse(e.to_string())),
                _ => {}
            }
            buf.clear();
        }

        debug!("Parsed NZB with {} files", nzb.files.len());
        validate_nzb(&nzb)?;
        Ok(nzb)
    }
}

/// Pull every attribute of an element into one map so the per-element
/// parsers can consume fields by name.
fn collect_attributes(element: &BytesStart) -> Result<HashMap<String, String>, NzbError> {
    element
        .attributes()
        .map(|attr| {
            let attr = attr.map_err(|e| NzbError::Parse(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| NzbError::Parse(e.to_string()))?
                .into_owned();
            Ok((key, value))
        })
        .collect()
}

fn meta_type(element: &BytesStart) -> Result<Option<String>, NzbError> {
    Ok(collect_attributes(element)?.remove("type"))
}

fn parse_file_start(element: &BytesStart) -> Result<NzbFile, NzbError> {
    let mut attrs = collect_attributes(element)?;
    let date = attrs
        .remove("date")
        .and_then(|raw| parse_date(&raw))
        .unwrap_or_else(Utc::now);

    Ok(NzbFile::new(
        attrs.remove("subject").unwrap_or_default(),
        attrs.remove("poster").unwrap_or_default(),
        date,
    ))
}

fn parse_segment_start(element: &BytesStart) -> Result<NzbSegment, NzbError> {
    let mut attrs = collect_attributes(element)?;
    let mut numeric = |key: &str| -> Result<u64, NzbError> {
        match attrs.remove(key) {
            None => Ok(0),
            Some(raw) => raw
                .parse()
                .map_err(|_| NzbError::Parse(format!("segment {key} is not a number: {raw}"))),
        }
    };

    let number = numeric("number")? as u32;
    let bytes = numeric("bytes")?;
    Ok(NzbSegment {
        message_id: String::new(),
        number,
        bytes,
    })
}

/// NZB file dates are usually unix seconds; some indexers emit RFC 3339
/// or RFC 2822 instead. Unparseable dates are dropped, not fatal.
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(epoch) = raw.parse::<i64>() {
        return DateTime::from_timestamp(epoch, 0);
    }
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

static QUOTED_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).unwrap());

/// Subjects follow a loose grammar: `[i/n]` prefix, the file name
/// (usually quoted), a `yEnc` marker, a `(part/total)` counter. Prefer the
/// quoted name; otherwise drop the yEnc trailer and counters and keep the
/// longest token shaped like a file name.
fn filename_from_subject(subject: &str) -> String {
    if let Some(captures) = QUOTED_NAME_RE.captures(subject) {
        return normalize_path(&captures[1]);
    }

    let before_trailer = subject.split(" yEnc").next().unwrap_or(subject);
    before_trailer
        .split_whitespace()
        .filter(|token| !token.starts_with('(') && !token.starts_with('['))
        .filter(|token| has_extension_shape(token))
        .max_by_key(|token| token.len())
        .map(normalize_path)
        .unwrap_or_else(|| normalize_path(before_trailer))
}

fn has_extension_shape(token: &str) -> bool {
    token
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| {
            !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

fn validate_nzb(nzb: &Nzb) -> Result<(), NzbError> {
    if nzb.files.is_empty() {
        return Err(NzbError::Empty);
    }

    for file in &nzb.files {
        for segment in &file.segments {
            if segment.message_id.is_empty() {
                return Err(NzbError::MissingMessageId(file.path.clone()));
            }
        }
    }

    Ok(())
}
