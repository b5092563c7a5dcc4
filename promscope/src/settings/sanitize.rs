//! Sanitized configuration projection served by `GET /api/v1/configs`.

use super::Settings;
use url::Url;

/// Returns the settings as a JSON value with secret fields blanked.
///
/// Connection URLs keep their scheme, host and path but lose any embedded
/// credentials. Unparsable URLs are blanked wholesale rather than risking a
/// credential leak.
pub fn sanitized(settings: &Settings) -> serde_json::Value {
    let mut settings = settings.clone();

    settings.database.postgres.url = redact_url(&settings.database.postgres.url);
    settings.otlp.catalog.seen_store.url = redact_url(&settings.otlp.catalog.seen_store.url);

    // Settings are plain data; serialization cannot fail.
    serde_json::to_value(&settings).unwrap_or(serde_json::Value::Null)
}

fn redact_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return "<redacted>".into();
    };

    if !url.username().is_empty() || url.password().is_some() {
        let _ = url.set_username("");
        let _ = url.set_password(None);
    }

    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_stripped() {
        assert_eq!(
            redact_url("postgres://user:hunter2@db:5432/promscope"),
            "postgres://db:5432/promscope"
        );
    }

    #[test]
    fn urls_without_credentials_are_kept() {
        assert_eq!(
            redact_url("redis://cache:6379"),
            "redis://cache:6379"
        );
    }

    #[test]
    fn unparsable_urls_are_blanked() {
        assert_eq!(redact_url("not a url"), "<redacted>");
    }

    #[test]
    fn sanitized_config_has_no_password() {
        let mut settings = Settings::default();
        settings.database.postgres.url = "postgres://svc:secret@db/prom".into();

        let dump = serde_json::to_string(&sanitized(&settings)).unwrap();

        assert!(!dump.contains("secret"));
    }
}
