//! Validación y saneamiento de plantillas de widgets.
//!
//! El tipo de widget se extrae del marcado original con el patrón `tb-<kind>-widget`
//! (gana la primera coincidencia) y después el HTML se limpia contra una lista
//! blanca de etiquetas y atributos. Las etiquetas no permitidas se eliminan pero su
//! texto interior se conserva, salvo en elementos ejecutables (`script`, `style`, ...)
//! cuyo contenido se descarta completo.


use std::sync::LazyLock;
use regex::Regex;
use tracing::debug;
use super::domain::{ParsedTemplate, WidgetKind};


static WIDGET_SELECTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"tb-([\w-]+)-widget").expect("patrón de selector válido")
});


const BASE_TAGS: [&str; 12] = [
    "div", "span", "canvas", "svg",
    "tb-value-chart-card-widget",
    "tb-value-card-widget",
    "tb-aggregated-value-card-widget",
    "tb-status-widget",
    "tb-count-widget",
    "tb-progress-bar-widget",
    "tb-markdown-widget",
    "tb-label-card-widget",
];

const ALLOWED_ATTRS: [&str; 7] = ["id", "class", "style", "width", "height", "ctx", "widgettitlepanel"];

/// Elementos cuyo contenido nunca se conserva.
const DROP_CONTENT_TAGS: [&str; 8] = ["script", "style", "iframe", "noscript", "object", "embed", "template", "textarea"];


/// Valida una plantilla y extrae el tipo de widget. Nunca falla: una entrada vacía
/// produce una plantilla inválida.
pub fn parse_template(raw_html: &str) -> ParsedTemplate {

    if raw_html.trim().is_empty() {
        debug!("Debug: plantilla vacía");
        return ParsedTemplate { clean_html: String::new(), widget_type: None, is_valid: false };
    }

    let widget_type = extract_widget_type(raw_html);
    let clean_html = sanitize(raw_html);

    ParsedTemplate {
        clean_html,
        is_valid: widget_type.is_some(),
        widget_type,
    }
}


pub fn extract_widget_type(raw_html: &str) -> Option<WidgetKind> {
    let selector = WIDGET_SELECTOR.find(raw_html)?;
    let kind = WidgetKind::from_selector(selector.as_str());
    if kind.is_none() {
        debug!("Debug: selector desconocido {}", selector.as_str());
    }
    kind
}


fn is_allowed_tag(name: &str) -> bool {
    BASE_TAGS.contains(&name) || WidgetKind::selectors().any(|selector| selector == name)
}


fn is_allowed_attr(name: &str) -> bool {
    ALLOWED_ATTRS.iter().any(|allowed| allowed.eq_ignore_ascii_case(name))
}


/// Limpia el marcado conservando sólo etiquetas y atributos de la lista blanca.
pub fn sanitize(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        let tail = &rest[lt..];

        if let Some(comment) = tail.strip_prefix("<!--") {
            rest = match comment.find("-->") {
                Some(end) => &comment[end + 3..],
                None => "",
            };
            continue;
        }

        if tail.starts_with("<!") || tail.starts_with("<?") {
            rest = match tail.find('>') {
                Some(end) => &tail[end + 1..],
                None => "",
            };
            continue;
        }

        let closing = tail.starts_with("</");
        let name_start = if closing { 2 } else { 1 };
        let name_len = tail[name_start..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == ':'))
            .unwrap_or(tail.len() - name_start);

        if name_len == 0 {
            // `<` suelto dentro del texto
            out.push_str("&lt;");
            rest = &tail[1..];
            continue;
        }

        let name = tail[name_start..name_start + name_len].to_ascii_lowercase();
        let Some(tag_end) = find_tag_end(&tail[name_start + name_len..]) else {
            // etiqueta sin cerrar: se descarta el resto
            rest = "";
            break;
        };
        let attrs_src = &tail[name_start + name_len..name_start + name_len + tag_end];
        let after = &tail[name_start + name_len + tag_end + 1..];

        if closing {
            if is_allowed_tag(&name) {
                out.push_str("</");
                out.push_str(&name);
                out.push('>');
            }
            rest = after;
            continue;
        }

        if DROP_CONTENT_TAGS.contains(&name.as_str()) {
            rest = skip_element(after, &name);
            continue;
        }

        if is_allowed_tag(&name) {
            out.push('<');
            out.push_str(&name);
            for (attr, value) in parse_attributes(attrs_src) {
                if !is_allowed_attr(&attr) {
                    continue;
                }
                let decoded = html_escape::decode_html_entities(&value);
                if decoded.to_ascii_lowercase().contains("javascript:") {
                    continue;
                }
                out.push(' ');
                out.push_str(&attr);
                out.push_str("=\"");
                out.push_str(&html_escape::encode_double_quoted_attribute(&decoded));
                out.push('"');
            }
            if attrs_src.trim_end().ends_with('/') {
                out.push_str(" /");
            }
            out.push('>');
        }
        rest = after;
    }

    out.push_str(rest);
    out
}


/// Posición del `>` que cierra la etiqueta, ignorando los que aparecen entre comillas.
fn find_tag_end(src: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, c) in src.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '>') => return Some(idx),
            _ => {}
        }
    }
    None
}


fn skip_element<'a>(src: &'a str, name: &str) -> &'a str {
    let lower = src.to_ascii_lowercase();
    let close = format!("</{name}");
    match lower.find(&close) {
        Some(pos) => match src[pos..].find('>') {
            Some(end) => &src[pos + end + 1..],
            None => "",
        },
        None => "",
    }
}


fn parse_attributes(src: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut rest = src;

    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '/');
        if rest.is_empty() {
            break;
        }

        let name_len = rest
            .find(|c: char| c.is_whitespace() || c == '=' || c == '/')
            .unwrap_or(rest.len());
        let name = rest[..name_len].to_string();
        rest = rest[name_len..].trim_start();

        let Some(value_src) = rest.strip_prefix('=') else {
            attrs.push((name, String::new()));
            continue;
        };
        let value_src = value_src.trim_start();

        let (value, consumed) = match value_src.chars().next() {
            Some(q @ ('"' | '\'')) => match value_src[1..].find(q) {
                Some(end) => (&value_src[1..1 + end], end + 2),
                None => (&value_src[1..], value_src.len()),
            },
            _ => {
                let end = value_src.find(char::is_whitespace).unwrap_or(value_src.len());
                (&value_src[..end], end)
            }
        };

        attrs.push((name, value.to_string()));
        rest = &value_src[consumed..];
    }

    attrs
}
