//! Minimal XML rendering and scanning for the three fixed envelope schemas
//! (CodeInput, CodeOutput, History). File contents and log entries travel in
//! CDATA sections so they survive byte-exact; everything else is escaped
//! character data. The scanner is CDATA-aware so payload text can never be
//! mistaken for markup.

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";

pub(crate) fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn unescape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let known = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
        ];
        match known.iter().find(|(entity, _)| rest.starts_with(entity)) {
            Some((entity, ch)) => {
                out.push(*ch);
                rest = &rest[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Wraps `s` in a CDATA section. A literal `]]>` inside the payload would
/// close the section early, so it is split across two sections.
pub(crate) fn cdata(s: &str) -> String {
    let safe = s.replace(CDATA_CLOSE, "]]]]><![CDATA[>");
    format!("{CDATA_OPEN}{safe}{CDATA_CLOSE}")
}

/// A raw element slice: the start tag's attribute text and the unparsed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawElement<'a> {
    pub attrs: &'a str,
    pub body: &'a str,
}

/// Finds `needle` in `xml` at or after `from`, skipping over CDATA sections.
fn find_outside_cdata(xml: &str, needle: &str, from: usize) -> Option<usize> {
    let mut pos = from;
    loop {
        let rel_needle = xml[pos..].find(needle)?;
        match xml[pos..].find(CDATA_OPEN) {
            Some(rel_cdata) if rel_cdata < rel_needle => {
                let cdata_body = pos + rel_cdata + CDATA_OPEN.len();
                let rel_close = xml[cdata_body..].find(CDATA_CLOSE)?;
                pos = cdata_body + rel_close + CDATA_CLOSE.len();
            }
            _ => return Some(pos + rel_needle),
        }
    }
}

/// Collects every `<tag …>…</tag>` (or self-closing `<tag …/>`) occurrence.
/// The schemas handled here never nest an element inside one of the same
/// name, so the first matching close tag ends the element.
pub(crate) fn find_elements<'a>(xml: &'a str, tag: &str) -> Vec<RawElement<'a>> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut pos = 0usize;

    while let Some(start) = find_outside_cdata(xml, &open, pos) {
        let after_name = start + open.len();
        let boundary_ok = xml[after_name..]
            .chars()
            .next()
            .is_some_and(|c| c == '>' || c == '/' || c.is_whitespace());
        if !boundary_ok {
            pos = after_name;
            continue;
        }
        let Some(rel_tag_end) = xml[after_name..].find('>') else {
            return out;
        };
        let tag_end = after_name + rel_tag_end;
        if xml[..tag_end].ends_with('/') {
            out.push(RawElement {
                attrs: &xml[after_name..tag_end - 1],
                body: "",
            });
            pos = tag_end + 1;
            continue;
        }
        let body_start = tag_end + 1;
        let Some(close_pos) = find_outside_cdata(xml, &close, body_start) else {
            return out;
        };
        out.push(RawElement {
            attrs: &xml[after_name..tag_end],
            body: &xml[body_start..close_pos],
        });
        pos = close_pos + close.len();
    }
    out
}

pub(crate) fn find_element<'a>(xml: &'a str, tag: &str) -> Option<RawElement<'a>> {
    find_elements(xml, tag).into_iter().next()
}

/// Reads a double-quoted attribute value from a start tag's attribute text.
pub(crate) fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = attrs.find(&needle)? + needle.len();
    let end = attrs[start..].find('"')? + start;
    Some(unescape_text(&attrs[start..end]))
}

/// Recovers the text payload of an element body. CDATA payloads concatenate
/// verbatim (rejoining a split `]]>`); plain character data is unescaped.
/// Indentation around CDATA sections is dropped.
pub(crate) fn element_text(body: &str) -> String {
    if !body.contains(CDATA_OPEN) {
        return unescape_text(body);
    }
    let mut out = String::new();
    let mut rest = body;
    while let Some(start) = rest.find(CDATA_OPEN) {
        let before = &rest[..start];
        if !before.trim().is_empty() {
            out.push_str(&unescape_text(before.trim()));
        }
        let after = &rest[start + CDATA_OPEN.len()..];
        match after.find(CDATA_CLOSE) {
            Some(end) => {
                out.push_str(&after[..end]);
                rest = &after[end + CDATA_CLOSE.len()..];
            }
            None => {
                out.push_str(after);
                rest = "";
            }
        }
    }
    if !rest.trim().is_empty() {
        out.push_str(&unescape_text(rest.trim()));
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn escape_and_unescape_round_trip() {
        let raw = "a < b && c > \"d\"";
        assert_eq!(unescape_text(&escape_text(raw)), raw);
        assert_eq!(unescape_text(&escape_attr(raw)), raw);
    }

    #[test]
    fn cdata_splits_closing_marker() {
        let wrapped = cdata("begin]]>end");
        assert_eq!(wrapped, "<![CDATA[begin]]]]><![CDATA[>end]]>");
        assert_eq!(element_text(&wrapped), "begin]]>end");
    }

    #[test]
    fn element_text_reads_plain_and_cdata_bodies() {
        assert_eq!(element_text("a &amp; b"), "a & b");
        assert_eq!(element_text("<![CDATA[x < y]]>"), "x < y");
    }

    #[test]
    fn find_elements_collects_siblings_with_attrs() {
        let xml = r#"<Files><File path="a">1</File><File path="b">2</File></Files>"#;
        let files = find_elements(xml, "File");
        assert_eq!(files.len(), 2);
        assert_eq!(attr_value(files[0].attrs, "path").as_deref(), Some("a"));
        assert_eq!(files[1].body, "2");
    }

    #[test]
    fn find_elements_skips_markup_inside_cdata() {
        let xml = "<Log><![CDATA[</Log> not really]]></Log>";
        let logs = find_elements(xml, "Log");
        assert_eq!(logs.len(), 1);
        assert_eq!(element_text(logs[0].body), "</Log> not really");
    }

    #[test]
    fn self_closing_elements_have_empty_bodies() {
        let xml = "<Changelog><TODO/></Changelog>";
        let todo = find_element(xml, "TODO").expect("todo element");
        assert_eq!(todo.body, "");
    }

    #[test]
    fn prefix_tags_do_not_match() {
        let xml = "<Filex>nope</Filex><File>yes</File>";
        let files = find_elements(xml, "File");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].body, "yes");
    }
}
