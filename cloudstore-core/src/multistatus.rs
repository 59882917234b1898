use std::time::UNIX_EPOCH;

use roxmltree::{Document, Node};
use url::Url;

use crate::client::DavError;

const DAV_NS: &str = "DAV:";

/// One `<response>` of a multistatus document, reduced to the properties the
/// synchronizers use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    pub url: Url,
    pub version: Option<String>,
    pub is_collection: bool,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub modified: Option<i64>,
}

/// Parses a `207 Multi-Status` body. Hrefs are resolved against `request_url`;
/// only properties reported inside a `200` propstat are taken.
pub fn parse_multistatus(body: &str, request_url: &Url) -> Result<Vec<DavEntry>, DavError> {
    let document = Document::parse(body)?;
    let root = document.root_element();
    if !is_dav(root, "multistatus") {
        return Err(DavError::InvalidResponse(format!(
            "expected DAV: multistatus, found {}",
            root.tag_name().name()
        )));
    }

    dav_children(root, "response")
        .map(|response| parse_response(response, request_url))
        .collect()
}

fn parse_response(response: Node<'_, '_>, request_url: &Url) -> Result<DavEntry, DavError> {
    let href = dav_children(response, "href")
        .next()
        .and_then(|node| node.text())
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .ok_or_else(|| DavError::InvalidResponse("response without href".into()))?;
    let url = request_url.join(href)?;

    let mut entry = DavEntry {
        url,
        version: None,
        is_collection: false,
        content_type: None,
        content_length: None,
        modified: None,
    };

    for propstat in dav_children(response, "propstat") {
        let ok = dav_children(propstat, "status")
            .next()
            .and_then(|node| node.text())
            .and_then(status_code)
            == Some(200);
        if !ok {
            continue;
        }
        for prop in dav_children(propstat, "prop") {
            for property in prop.children().filter(|node| node.is_element()) {
                if property.tag_name().namespace() != Some(DAV_NS) {
                    continue;
                }
                match property.tag_name().name() {
                    "getetag" => entry.version = text(property),
                    "resourcetype" => {
                        entry.is_collection = dav_children(property, "collection").next().is_some()
                    }
                    "getcontenttype" => entry.content_type = text(property),
                    "getcontentlength" => {
                        entry.content_length = text(property).and_then(|v| v.parse().ok())
                    }
                    "getlastmodified" => {
                        entry.modified = text(property).as_deref().and_then(parse_http_date)
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(entry)
}

fn is_dav(node: Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().namespace() == Some(DAV_NS) && node.tag_name().name() == name
}

fn dav_children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(move |child| is_dav(*child, name))
}

fn text(node: Node<'_, '_>) -> Option<String> {
    node.text()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

// "HTTP/1.1 200 OK"
fn status_code(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1)?.parse().ok()
}

fn parse_http_date(value: &str) -> Option<i64> {
    let time = httpdate::parse_http_date(value).ok()?;
    let secs = time.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}
