use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::indexer::IndexerError;

/// Newznab category buckets the addon searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Category {
    Movies,
    Tv,
    #[default]
    Any,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Movies => "2000",
            Category::Tv => "5000",
            Category::Any => "",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub imdb_id: Option<String>,
    pub tmdb_id: Option<String>,
    pub tvdb_id: Option<String>,
    pub category: Category,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub limit: usize,
}

/// One search result in the unified shape every backend parses into.
#[derive(Debug, Clone, Default)]
pub struct Item {
    pub title: String,
    pub link: String,
    pub guid: String,
    pub pub_date: Option<DateTime<Utc>>,
    pub category: String,
    pub size: u64,
    pub grabs: u64,
    pub attributes: Vec<(String, String)>,
    /// Name of the indexer the item came through.
    pub source_indexer: String,
    /// Real upstream indexer, when a meta-indexer reports it.
    pub actual_indexer: Option<String>,
    /// Upstream guid, when a meta-indexer reports it.
    pub actual_guid: Option<String>,
}

impl Item {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The indexer name used for oracle bookkeeping.
    pub fn effective_indexer(&self) -> &str {
        self.actual_indexer
            .as_deref()
            .unwrap_or(&self.source_indexer)
    }

    /// The guid used for oracle bookkeeping; falls back to the plain guid
    /// when the meta-indexer did not attribute one.
    pub fn effective_guid(&self) -> &str {
        self.actual_guid.as_deref().unwrap_or(&self.guid)
    }
}

/// Parse a Newznab RSS search response into items. Size normalization:
/// `<size>`, then `enclosure length`, then the `size` attribute.
pub fn parse_search_response(xml: &[u8], source_indexer: &str) -> Result<Vec<Item>, IndexerError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut buf = Vec::new();

    let mut current: Option<Item> = None;
    let mut size_element = 0u64;
    let mut enclosure_length = 0u64;
    let mut text_target: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"item" => {
                        current = Some(Item {
                            source_indexer: source_indexer.to_string(),
                            ..Item::default()
                        });
                        size_element = 0;
                        enclosure_length = 0;
                    }
                    b"title" if current.is_some() => text_target = Some("title"),
                    b"link" if current.is_some() => text_target = Some("link"),
                    b"guid" if current.is_some() => text_target = Some("guid"),
                    b"pubDate" if current.is_some() => text_target = Some("pubDate"),
                    b"category" if current.is_some() => text_target = Some("category"),
                    b"size" if current.is_some() => text_target = Some("size"),
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                let local = e.local_name();
                if current.is_none() {
                    // attributes outside items are channel metadata
                } else if local.as_ref() == b"enclosure" {
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"length" {
                            if let Ok(value) = attr.unescape_value() {
                                enclosure_length = value.parse().unwrap_or(0);
                            }
                        } else if attr.key.local_name().as_ref() == b"url" {
                            if let (Ok(value), Some(item)) =
                                (attr.unescape_value(), current.as_mut())
                            {
                                if item.link.is_empty() {
                                    item.link = value.to_string();
                                }
                            }
                        }
                    }
                } else if local.as_ref() == b"attr" {
                    let mut name = None;
                    let mut value = None;
                    for attr in e.attributes().flatten() {
                        match attr.key.local_name().as_ref() {
                            b"name" => name = attr.unescape_value().ok().map(|v| v.to_string()),
                            b"value" => value = attr.unescape_value().ok().map(|v| v.to_string()),
                            _ => {}
                        }
                    }
                    if let (Some(name), Some(value), Some(item)) = (name, value, current.as_mut()) {
                        item.attributes.push((name, value));
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let (Some(target), Some(item)) = (text_target, current.as_mut()) {
                    let text = e
                        .unescape()
                        .map_err(|e| IndexerError::Parse(e.to_string()))?
                        .trim()
                        .to_string();
                    match target {
                        "title" => item.title = text,
                        "link" => item.link = text,
                        "guid" => item.guid = text,
                        "category" => item.category = text,
                        "pubDate" => {
                            item.pub_date = DateTime::parse_from_rfc2822(&text)
                                .map(|dt| dt.with_timezone(&Utc))
                                .ok();
                        }
                        "size" => size_element = text.parse().unwrap_or(0),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                text_target = None;
                if e.local_name().as_ref() == b"item" {
                    if let Some(mut item) = current.take() {
                        item.size = if size_element > 0 {
                            size_element
                        } else if enclosure_length > 0 {
                            enclosure_length
                        } else {
                            item.attribute("size")
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(0)
                        };
                        item.grabs = item
                            .attribute("grabs")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        items.push(item);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(IndexerError::Parse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:newznab="http://www.newznab.com/DTD/2010/feeds/attributes/">
  <channel>
    <item>
      <title>Movie.2023.1080p.BluRay.x264-GRP</title>
      <guid isPermaLink="false">abc123</guid>
      <link>https://indexer.example/getnzb/abc123</link>
      <pubDate>Fri, 01 Dec 2023 10:30:00 +0000</pubDate>
      <category>Movies &gt; HD</category>
      <enclosure url="https://indexer.example/getnzb/abc123.nzb" length="4200000000" type="application/x-nzb"/>
      <newznab:attr name="grabs" value="17"/>
      <newznab:attr name="size" value="4100000000"/>
    </item>
    <item>
      <title>Movie.2023.720p.WEB-DL</title>
      <guid>def456</guid>
      <size>1500000000</size>
      <link>https://indexer.example/getnzb/def456</link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_items_with_size_cascade() {
        let items = parse_search_response(RSS.as_bytes(), "nzbgeek").unwrap();
        assert_eq!(items.len(), 2);

        // No <size> element: falls back to enclosure length, not the attr.
        let first = &items[0];
        assert_eq!(first.title, "Movie.2023.1080p.BluRay.x264-GRP");
        assert_eq!(first.size, 4_200_000_000);
        assert_eq!(first.grabs, 17);
        assert_eq!(first.guid, "abc123");
        assert_eq!(first.source_indexer, "nzbgeek");
        assert!(first.pub_date.is_some());

        // <size> element wins.
        assert_eq!(items[1].size, 1_500_000_000);
    }

    #[test]
    fn effective_guid_falls_back() {
        let mut item = Item {
            guid: "plain".to_string(),
            ..Item::default()
        };
        assert_eq!(item.effective_guid(), "plain");
        item.actual_guid = Some("upstream".to_string());
        assert_eq!(item.effective_guid(), "upstream");
    }
}
