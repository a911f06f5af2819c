use super::*;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PAGE: &str = r##"<!DOCTYPE html>
<html>
<head>
  <title>  Example   Domain </title>
  <style>body { color: red; }</style>
  <script>var tracking = "not text";</script>
</head>
<body>
  <h1>Welcome</h1>
  <p>This is <b>bold</b> and <a href="/about">about us</a>.</p>
  <noscript>Enable JavaScript</noscript>
  <div>Second<span>half</span></div>
  <a href="https://other.org/x">Other</a>
  <a href="docs/intro.html">Relative</a>
  <a href="/about">Duplicate</a>
  <a href="#top">Fragment</a>
  <a href="mailto:team@example.com">Mail</a>
  <a href="javascript:void(0)">Script</a>
  <a href="">Empty</a>
</body>
</html>"##;

fn base() -> Url {
    Url::parse("https://example.com/guide/").expect("base url should parse")
}

#[test]
fn validate_url_rules() {
    assert!(validate_url("https://example.com").is_ok());
    assert!(validate_url("http://example.com/path?q=1").is_ok());
    assert!(validate_url("ftp://example.com").is_err());
    assert!(validate_url("not a url").is_err());
    assert!(validate_url("mailto:team@example.com").is_err());
}

#[test]
fn parse_page_extracts_title_and_visible_text() {
    let page = parse_page(PAGE, &base()).expect("should parse page");

    assert_eq!(page.title, "Example Domain");
    assert!(page.text.starts_with("Welcome This is bold and about us."));
    assert!(page.text.contains("Secondhalf"));
    assert!(!page.text.contains("tracking"));
    assert!(!page.text.contains("color: red"));
    assert!(!page.text.contains("Enable JavaScript"));
    assert!(!page.text.contains("Example Domain"));
}

#[test]
fn links_are_absolute_unique_and_http_only() {
    let page = parse_page(PAGE, &base()).expect("should parse page");
    let links: Vec<&str> = page.links.iter().map(Url::as_str).collect();

    assert_eq!(
        links,
        vec![
            "https://example.com/about",
            "https://other.org/x",
            "https://example.com/guide/docs/intro.html",
            "https://example.com/guide/#top",
        ]
    );
}

#[test]
fn page_without_body_or_title() {
    let page = parse_page("plain words only", &base()).expect("should parse page");
    assert_eq!(page.title, "");
    assert_eq!(page.text, "plain words only");
    assert!(page.links.is_empty());
}

#[tokio::test]
async fn http_fetcher_reads_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .and(header("user-agent", "semsearch-test"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(PAGE, "text/html"))
        .expect(1)
        .mount(&server)
        .await;

    let settings = CrawlerSettings {
        user_agent: "semsearch-test".to_string(),
        ..CrawlerSettings::default()
    };
    let page = HttpFetcher::new(&settings)
        .fetch(&format!("{}/page", server.uri()))
        .await
        .expect("should fetch page");

    assert_eq!(page.title, "Example Domain");
    assert_eq!(page.links.len(), 4);
}

#[tokio::test]
async fn http_fetcher_reports_status_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let result = HttpFetcher::new(&CrawlerSettings::default())
        .fetch(&format!("{}/missing", server.uri()))
        .await;

    let error = result.expect_err("404 should fail the fetch");
    assert!(error.to_string().contains("404"));
}

#[tokio::test]
async fn http_fetcher_rejects_invalid_urls() {
    let result = HttpFetcher::new(&CrawlerSettings::default())
        .fetch("ftp://example.com/file")
        .await;
    assert!(result.is_err());
}
