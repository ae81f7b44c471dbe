use chrono::{TimeZone, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use thiserror::Error;

use crate::storage::{FeedRecord, ItemRecord};

#[derive(Debug, Error)]
#[error("Failed to render feed: {0}")]
pub struct RenderError(String);

/// Render a feed record and its admitted items as an RSS 2.0 document.
///
/// Filtered items are skipped; at most `max_items` are written, in the
/// order given.
pub fn render_rss(
    feed: &FeedRecord,
    items: &[ItemRecord],
    max_items: usize,
) -> Result<String, RenderError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    emit(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;
    emit(
        &mut writer,
        Event::Start(BytesStart::new("rss").with_attributes([
            ("version", "2.0"),
            ("xmlns:dc", "http://purl.org/dc/elements/1.1/"),
        ])),
    )?;
    emit(&mut writer, Event::Start(BytesStart::new("channel")))?;

    text_element(&mut writer, "title", feed.display_title())?;
    text_element(&mut writer, "link", &feed.url)?;
    text_element(
        &mut writer,
        "description",
        feed.description.as_deref().unwrap_or(&feed.name),
    )?;
    if let Some(language) = &feed.language {
        text_element(&mut writer, "language", language)?;
    }
    if let Some(at) = feed.last_success_at {
        if let Some(date) = rfc2822(at) {
            text_element(&mut writer, "lastBuildDate", &date)?;
        }
    }
    if let Some(icon) = &feed.icon {
        emit(&mut writer, Event::Start(BytesStart::new("image")))?;
        text_element(&mut writer, "url", icon)?;
        text_element(&mut writer, "title", feed.display_title())?;
        text_element(&mut writer, "link", &feed.url)?;
        emit(&mut writer, Event::End(BytesEnd::new("image")))?;
    }

    for item in items.iter().filter(|i| !i.filtered).take(max_items) {
        write_item(&mut writer, item)?;
    }

    emit(&mut writer, Event::End(BytesEnd::new("channel")))?;
    emit(&mut writer, Event::End(BytesEnd::new("rss")))?;

    String::from_utf8(writer.into_inner()).map_err(|e| RenderError(e.to_string()))
}

fn write_item(writer: &mut Writer<Vec<u8>>, item: &ItemRecord) -> Result<(), RenderError> {
    emit(writer, Event::Start(BytesStart::new("item")))?;

    if let Some(title) = &item.title {
        text_element(writer, "title", title)?;
    }
    if let Some(link) = &item.link {
        text_element(writer, "link", link)?;
    }
    emit(
        writer,
        Event::Start(BytesStart::new("guid").with_attributes([("isPermaLink", "false")])),
    )?;
    emit(writer, Event::Text(BytesText::new(&item.native_id)))?;
    emit(writer, Event::End(BytesEnd::new("guid")))?;

    if let Some(description) = item.description.as_ref().or(item.content.as_ref()) {
        text_element(writer, "description", description)?;
    }
    if let Some(date) = item.published.or(item.updated).and_then(rfc2822) {
        text_element(writer, "pubDate", &date)?;
    }
    // RSS 2.0 <author> is an email address, optionally followed by the name
    match (&item.author_email, &item.author_name) {
        (Some(email), Some(name)) => {
            text_element(writer, "author", &format!("{} ({})", email, name))?
        }
        (Some(email), None) => text_element(writer, "author", email)?,
        (None, Some(name)) => text_element(writer, "dc:creator", name)?,
        (None, None) => {}
    }
    for category in &item.categories {
        text_element(writer, "category", category)?;
    }

    emit(writer, Event::End(BytesEnd::new("item")))
}

fn text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> Result<(), RenderError> {
    emit(writer, Event::Start(BytesStart::new(name)))?;
    emit(writer, Event::Text(BytesText::new(text)))?;
    emit(writer, Event::End(BytesEnd::new(name)))
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), RenderError> {
    writer
        .write_event(event)
        .map_err(|e| RenderError(e.to_string()))
}

fn rfc2822(timestamp: i64) -> Option<String> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|dt| dt.to_rfc2822())
}
