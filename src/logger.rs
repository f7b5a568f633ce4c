use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const FILTER_ENV_VARS: [&str; 2] = ["CONTEND_LOG", "RUST_LOG"];

/// Install the global subscriber. Repeated calls keep the first one, so
/// workers and tests can call this unconditionally.
pub fn init_logging(verbose: bool) {
    let filter = resolve_filter(verbose, |name| std::env::var(name).ok());
    drop(
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    );
}

/// Filter precedence: `CONTEND_LOG`, then `RUST_LOG`, then the service
/// default. Unparsable directives fall back to the default rather than
/// silencing the process. The lookup is a closure so tests never touch the
/// real environment.
fn resolve_filter<TLookup>(verbose: bool, lookup: TLookup) -> EnvFilter
where
    TLookup: Fn(&str) -> Option<String>,
{
    let fallback = if verbose {
        "contend=debug,tower_http=debug"
    } else {
        "contend=info,tower_http=warn"
    };
    FILTER_ENV_VARS
        .iter()
        .find_map(|name| lookup(name))
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_beats_the_service_default() -> Result<(), String> {
        let filter = resolve_filter(false, |name| {
            (name == "CONTEND_LOG").then(|| "trace".to_owned())
        });
        let rendered = filter.to_string();
        if !rendered.contains("trace") {
            return Err(format!("CONTEND_LOG override lost: {}", rendered));
        }
        Ok(())
    }

    #[test]
    fn rust_log_is_the_second_choice() -> Result<(), String> {
        let filter = resolve_filter(false, |name| {
            (name == "RUST_LOG").then(|| "contend=error".to_owned())
        });
        let rendered = filter.to_string();
        if !rendered.contains("contend=error") {
            return Err(format!("RUST_LOG fallback lost: {}", rendered));
        }
        Ok(())
    }

    #[test]
    fn bad_directives_fall_back_to_the_service_default() -> Result<(), String> {
        let filter = resolve_filter(true, |name| {
            (name == "CONTEND_LOG").then(|| "not==a==directive".to_owned())
        });
        let rendered = filter.to_string();
        if !rendered.contains("contend=debug") {
            return Err(format!("expected verbose default, got: {}", rendered));
        }
        Ok(())
    }

    #[test]
    fn quiet_default_scopes_to_the_service() -> Result<(), String> {
        let filter = resolve_filter(false, |_name| None);
        let rendered = filter.to_string();
        if !rendered.contains("contend=info") || !rendered.contains("tower_http=warn") {
            return Err(format!("unexpected default directives: {}", rendered));
        }
        Ok(())
    }

    #[test]
    fn repeated_init_keeps_the_first_subscriber() {
        init_logging(false);
        init_logging(true);
    }
}
