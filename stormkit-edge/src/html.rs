//! Built-in HTML pages.
//!
//! Served when a deployment has no custom page for the situation: 404,
//! internal errors (with a runtime-logs link), the "service is being set
//! up" and "service not started yet" retry pages, and the custom-port
//! rejection page.

/// Render the shared page shell.
pub fn render(title: &str, head: &str, content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
{head}
<style>
body {{ font-family: -apple-system, system-ui, sans-serif; background: #0f092b; color: #e5e2f2; margin: 0; }}
main {{ display: flex; min-height: 100vh; align-items: center; justify-content: center; }}
.container {{ max-width: 42rem; padding: 2rem; }}
.text-center {{ text-align: center; }}
a {{ color: #78f0fc; }}
</style>
</head>
<body>
<main>{content}</main>
</body>
</html>
"#
    )
}

/// Built-in 404 page.
pub fn not_found(app_url: &str) -> String {
    let link = if app_url.is_empty() {
        String::new()
    } else {
        format!(r#"<p><a href="{app_url}">Go to your apps</a></p>"#)
    };

    render(
        "Stormkit - Page Not Found",
        "",
        &format!(
            r#"<div class="container text-center"><h1>404</h1><h2>There is nothing here</h2>{link}</div>"#
        ),
    )
}

/// Built-in error page with a pointer to the runtime logs.
pub fn server_error(error_msg: &str, runtime_logs_url: &str) -> String {
    let logs = if runtime_logs_url.is_empty() {
        String::new()
    } else {
        format!(r#"<p><a href="{runtime_logs_url}">Check the runtime logs</a></p>"#)
    };

    render(
        "Stormkit - Error",
        "",
        &format!(
            r#"<div class="container text-center"><h1>Something went wrong</h1><p>{}</p>{logs}</div>"#,
            escape(error_msg)
        ),
    )
}

/// Page returned while a service's setup scripts are running.
/// Refreshes itself after `retry_after` seconds.
pub fn service_setting_up(retry_after: u32) -> String {
    render(
        "Stormkit - Setting up service",
        &format!(r#"<meta http-equiv="refresh" content="{retry_after}">"#),
        r#"<h1 class="text-center">Service is currently being set up, please try again later.</h1>"#,
    )
}

/// Page returned while waiting for a freshly started service to bind.
pub fn service_starting() -> String {
    render(
        "Stormkit - Setting up service",
        r#"<meta http-equiv="refresh" content="1">"#,
        r#"<h1 class="text-center">Service not yet started, retry in a bit.</h1>"#,
    )
}

/// 400 page for custom `PORT` on an unpublished deployment.
pub fn custom_port_rejected() -> String {
    render(
        "Stormkit - Invalid request",
        "",
        r#"<div class="container text-center">
<h2>Custom ports are only available for published deployments</h2>
<h3>Please remove the PORT environment variable to use dynamic ports,<br />or access this service via the published URL.</h3>
</div>"#,
    )
}

fn escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_contains_app_link() {
        let page = not_found("https://stormkit.example.org/");
        assert!(page.contains("404"));
        assert!(page.contains("https://stormkit.example.org/"));

        let bare = not_found("");
        assert!(!bare.contains("<a href"));
    }

    #[test]
    fn test_server_error_escapes_message() {
        let page = server_error("<script>alert(1)</script>", "");
        assert!(!page.contains("<script>alert"));
        assert!(page.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_setting_up_page_refreshes() {
        let page = service_setting_up(5);
        assert!(page.contains(r#"http-equiv="refresh" content="5""#));
    }
}
