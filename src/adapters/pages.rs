//! HTML pages rendered by the proxy itself: errors, the "app is starting"
//! spinner, the provider selection list and the password form.
use axum::{
    body::Body,
    http::{Response, StatusCode, header},
    response::IntoResponse,
};

use crate::{adapters::auth::SELECTION_PATH, core::ProxyError};

/// Seconds between reloads of the "starting" page.
const STARTING_REFRESH_SECS: u32 = 5;

/// A provider offered on the selection page.
pub struct ProviderLink<'a> {
    pub id: &'a str,
    pub name: &'a str,
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn layout(title: &str, head_extra: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         {head_extra}<title>{title}</title>\n</head>\n<body>\n{body}\n</body>\n</html>\n",
        title = escape_html(title),
    )
}

fn html_response(status: StatusCode, html: String) -> Response<Body> {
    let mut response = Response::new(Body::from(html));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

pub fn error_page(err: &ProxyError) -> Response<Body> {
    let status = err.status();
    if let ProxyError::AppStarting { app_id } = err {
        let body = format!(
            "<main class=\"starting\">\n<div class=\"spinner\"></div>\n<h1>Application is starting</h1>\n\
             <p>Application \"{}\" is waking up. This page reloads automatically.</p>\n</main>",
            escape_html(app_id.as_str())
        );
        let head = format!("<meta http-equiv=\"refresh\" content=\"{STARTING_REFRESH_SECS}\">\n");
        return html_response(status, layout("Application is starting", &head, &body));
    }

    let mut body = format!(
        "<main class=\"error\">\n<h1>{}</h1>\n<p>{}</p>\n",
        escape_html(err.title()),
        escape_html(&err.user_message())
    );
    if let Some(exception_id) = err.exception_id() {
        body.push_str(&format!(
            "<p class=\"exception\">Exception ID: <code>{}</code></p>\n",
            escape_html(exception_id)
        ));
    }
    body.push_str("</main>");
    html_response(status, layout(err.title(), "", &body))
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        error_page(&self)
    }
}

/// Lists the providers as links to the selection endpoint; each link carries
/// the provider ID and the original redirect target.
pub fn selection_page(
    app_name: &str,
    providers: &[ProviderLink<'_>],
    redirect_to: &str,
    status: StatusCode,
) -> Response<Body> {
    let rd = urlencoding::encode(redirect_to);
    let mut items = String::new();
    for provider in providers {
        let href = format!(
            "{SELECTION_PATH}?provider={}&rd={rd}",
            urlencoding::encode(provider.id)
        );
        items.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            escape_html(&href),
            escape_html(provider.name)
        ));
    }
    let body = format!(
        "<main class=\"selection\">\n<h1>Sign in to {}</h1>\n<p>Choose an authentication provider:</p>\n\
         <ul>\n{items}</ul>\n</main>",
        escape_html(app_name)
    );
    html_response(status, layout("Sign in", "", &body))
}

/// Password prompt posting to the callback endpoint.
pub fn password_form(app_name: &str, provider_name: &str, action: &str, state: &str) -> Response<Body> {
    let body = format!(
        "<main class=\"password\">\n<h1>Sign in to {}</h1>\n<p>{}</p>\n\
         <form method=\"post\" action=\"{}\">\n\
         <input type=\"hidden\" name=\"state\" value=\"{}\">\n\
         <input type=\"password\" name=\"password\" autocomplete=\"current-password\" autofocus required>\n\
         <button type=\"submit\">Sign in</button>\n</form>\n</main>",
        escape_html(app_name),
        escape_html(provider_name),
        escape_html(action),
        escape_html(state),
    );
    html_response(StatusCode::UNAUTHORIZED, layout("Sign in", "", &body))
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;
    use crate::core::AppId;

    async fn body_text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;"
        );
    }

    #[tokio::test]
    async fn test_error_page_shows_exception_id() {
        let err = ProxyError::invalid_configuration(&AppId::new("123"), "secret detail");
        let exception_id = err.exception_id().unwrap().to_string();
        let response = error_page(&err);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_text(response).await;
        assert!(body.contains(&exception_id));
        assert!(!body.contains("secret detail"));
    }

    #[tokio::test]
    async fn test_starting_page_refreshes() {
        let response = error_page(&ProxyError::AppStarting {
            app_id: AppId::new("123"),
        });
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_text(response).await.contains("http-equiv=\"refresh\""));
    }

    #[tokio::test]
    async fn test_selection_links() {
        let providers = [
            ProviderLink { id: "oidc1", name: "First <IdP>" },
            ProviderLink { id: "oidc2", name: "Second" },
        ];
        let response = selection_page("My App", &providers, "/data?x=1", StatusCode::UNAUTHORIZED);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_text(response).await;
        assert!(body.contains("/_proxy/selection?provider=oidc1&amp;rd=%2Fdata%3Fx%3D1"));
        assert!(body.contains("/_proxy/selection?provider=oidc2&amp;rd=%2Fdata%3Fx%3D1"));
        assert!(body.contains("First &lt;IdP&gt;"));
    }
}
