//! `onibox://import` activation links.

use percent_encoding::percent_decode_str;
use url::Url;

const IMPORT_PREFIX: &str = "onibox://import/";
const SCHEME: &str = "onibox";
const IMPORT_HOST: &str = "import";

/// Config source embedded in an activation link, or `None` when `argument`
/// is not one.
///
/// Accepts `onibox://import/<encoded source>` and
/// `onibox://import?url=<encoded source>`.
pub fn parse_import_argument(argument: &str) -> Option<String> {
    let trimmed = argument.trim().trim_matches('"');
    if trimmed.is_empty() {
        return None;
    }

    if let Some(head) = trimmed.get(..IMPORT_PREFIX.len()) {
        if head.eq_ignore_ascii_case(IMPORT_PREFIX) {
            let candidate = trimmed[IMPORT_PREFIX.len()..].trim();
            return (!candidate.is_empty()).then(|| unescape(candidate));
        }
    }

    let url = Url::parse(trimmed).ok()?;
    if !url.scheme().eq_ignore_ascii_case(SCHEME)
        || !url.host_str().is_some_and(|host| host.eq_ignore_ascii_case(IMPORT_HOST))
    {
        return None;
    }

    let path = unescape(url.path());
    let path = path.trim_matches('/');
    if !path.is_empty() {
        return Some(path.to_string());
    }
    url.query().and_then(url_from_query)
}

/// First activation link among process arguments.
pub fn find_import_source<I, S>(args: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .find_map(|arg| parse_import_argument(arg.as_ref()))
}

fn url_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case("url"))
        .map(|(_, value)| unescape(value))
        .filter(|value| !value.trim().is_empty())
}

fn unescape(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_form_decodes_source() {
        assert_eq!(
            parse_import_argument("onibox://import/https%3A%2F%2Fexample.com%2Fc.json%3Ft%3D1"),
            Some("https://example.com/c.json?t=1".into())
        );
        assert_eq!(
            parse_import_argument("\"ONIBOX://Import/https://example.com/a b\""),
            Some("https://example.com/a b".into())
        );
    }

    #[test]
    fn query_form_reads_url_parameter() {
        assert_eq!(
            parse_import_argument("onibox://import?foo=1&URL=https%3A%2F%2Fexample.com%2Fc%2Bd.json"),
            Some("https://example.com/c+d.json".into())
        );
    }

    #[test]
    fn non_links_are_ignored() {
        assert_eq!(parse_import_argument("onibox://import/"), None);
        assert_eq!(parse_import_argument("onibox://import"), None);
        assert_eq!(parse_import_argument("onibox://settings/x"), None);
        assert_eq!(parse_import_argument("https://example.com/c.json"), None);
        assert_eq!(parse_import_argument("--autostart"), None);
    }

    #[test]
    fn finds_link_among_arguments() {
        let args = ["onibox.exe", "--autostart", "onibox://import/C%3A%5Cbox.json"];
        assert_eq!(find_import_source(args), Some(r"C:\box.json".into()));
        assert_eq!(find_import_source(["onibox.exe"]), None);
    }
}
