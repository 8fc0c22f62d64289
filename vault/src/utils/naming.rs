/// Identity discovery for agents running inside fabric containers.
///
/// Containers follow the fabric naming convention `flux<component>_<app>`
/// for their hostname. Explicit configuration always wins; the hostname
/// parse is the fallback for agents deployed without flags.

/// Splits a fabric container hostname into `(component, app)` names.
/// Returns `None` when the hostname does not follow the convention.
pub fn parse_container_hostname(hostname: &str) -> Option<(String, String)> {
    let trimmed = hostname.strip_prefix("flux")?;
    let (component, app) = trimmed.split_once('_')?;
    if component.is_empty() || app.is_empty() {
        return None;
    }
    Some((component.to_string(), app.to_string()))
}

/// Best-effort identity for this process: explicit values if given,
/// otherwise the container hostname, otherwise placeholder names usable in
/// local testing.
pub fn resolve_identity(
    component: Option<String>,
    app: Option<String>,
) -> (String, String) {
    if let (Some(component), Some(app)) = (component.clone(), app.clone()) {
        return (component, app);
    }

    let from_host = local_hostname().and_then(|h| parse_container_hostname(&h));

    match from_host {
        Some((host_component, host_app)) => (
            component.unwrap_or(host_component),
            app.unwrap_or(host_app),
        ),
        None => (
            component.unwrap_or_else(|| "agent".to_string()),
            app.unwrap_or_else(|| "testapp".to_string()),
        ),
    }
}

#[cfg(target_family = "unix")]
fn local_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
}

#[cfg(not(target_family = "unix"))]
fn local_hostname() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_container_hostname() {
        assert_eq!(
            parse_container_hostname("fluxweb_demoapp"),
            Some(("web".to_string(), "demoapp".to_string()))
        );
        assert_eq!(parse_container_hostname("not-a-fabric-host"), None);
        assert_eq!(parse_container_hostname("flux_demoapp"), None);
        assert_eq!(parse_container_hostname("fluxweb_"), None);
    }

    #[test]
    fn test_explicit_identity_wins() {
        let (component, app) =
            resolve_identity(Some("web".to_string()), Some("demoapp".to_string()));
        assert_eq!(component, "web");
        assert_eq!(app, "demoapp");
    }
}
