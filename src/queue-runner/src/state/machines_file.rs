use smallvec::SmallVec;

use super::machine::Machine;

/// Parse one `-`-able field: `-` (or nothing) means empty.
fn opt_field(token: Option<&str>) -> Option<String> {
    match token {
        None | Some("-") => None,
        Some(v) => Some(v.to_string()),
    }
}

fn list_field<const N: usize>(token: Option<&str>) -> SmallVec<[String; N]> {
    match token {
        None | Some("-") => SmallVec::new(),
        Some(v) => v
            .split(',')
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
    }
}

/// Parse the machines file format, one machine per non-comment line:
///
/// ```text
/// sshName sshKey systems maxJobs speedFactor supportedFeatures mandatoryFeatures publicHostKey
/// ```
///
/// Lists are comma-separated, `-` means empty, `#` starts a comment.
/// `@file` include lines must be resolved by the caller before parsing.
#[must_use]
pub fn parse_machines(content: &str) -> Vec<Machine> {
    let mut machines = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('@') {
            tracing::error!("unresolved include '{line}' in machines data, skipping");
            continue;
        }

        let mut tokens = line.split_whitespace();
        let Some(ssh_name) = tokens.next() else {
            continue;
        };
        let ssh_key = opt_field(tokens.next());
        let systems: SmallVec<[String; 4]> = list_field(tokens.next());
        let max_jobs = tokens.next().and_then(|v| v.parse().ok()).unwrap_or(1);
        let speed_factor = tokens.next().and_then(|v| v.parse().ok()).unwrap_or(1.0);
        let supported_features = list_field(tokens.next());
        let mandatory_features: SmallVec<[String; 4]> = list_field(tokens.next());
        let public_host_key = opt_field(tokens.next());

        if systems.is_empty() {
            tracing::warn!("machine '{ssh_name}' declares no systems, skipping");
            continue;
        }

        // mandatory features are implicitly supported
        let mut supported_features: SmallVec<[String; 8]> = supported_features;
        for f in &mandatory_features {
            if !supported_features.contains(f) {
                supported_features.push(f.clone());
            }
        }

        machines.push(Machine::new(
            ssh_name.to_string(),
            ssh_key,
            systems,
            supported_features,
            mandatory_features,
            max_jobs,
            speed_factor,
            public_host_key,
        ));
    }
    machines
}

/// Read a machines file, splicing in `@file` includes recursively.
pub async fn read_machines_file(path: &std::path::Path) -> std::io::Result<String> {
    let content = fs_err::tokio::read_to_string(path).await?;
    let mut expanded = String::with_capacity(content.len());
    for line in content.lines() {
        if let Some(include) = line.trim().strip_prefix('@') {
            match Box::pin(read_machines_file(std::path::Path::new(include))).await {
                Ok(included) => {
                    expanded.push_str(&included);
                    expanded.push('\n');
                }
                Err(e) => {
                    tracing::error!("Failed to read included machines file '{include}': {e}");
                }
            }
        } else {
            expanded.push_str(line);
            expanded.push('\n');
        }
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_parse_full_line() {
        let machines = parse_machines(
            "builder1.example.org /etc/keys/builder1 x86_64-linux,i686-linux 4 2.5 kvm,big-parallel benchmark ssh-ed25519_AAAA",
        );

        assert_eq!(machines.len(), 1);
        let m = &machines[0];
        assert_eq!(m.ssh_name, "builder1.example.org");
        assert_eq!(m.ssh_key.as_deref(), Some("/etc/keys/builder1"));
        assert_eq!(m.systems.as_slice(), ["x86_64-linux", "i686-linux"]);
        assert_eq!(m.max_jobs, 4);
        assert!((m.speed_factor - 2.5).abs() < f32::EPSILON);
        // benchmark is mandatory, so it is also supported
        assert_eq!(m.supported_features.as_slice(), ["kvm", "big-parallel", "benchmark"]);
        assert_eq!(m.mandatory_features.as_slice(), ["benchmark"]);
        assert_eq!(m.public_host_key.as_deref(), Some("ssh-ed25519_AAAA"));
    }

    #[test]
    fn test_parse_dash_means_empty() {
        let machines = parse_machines("builder2 - aarch64-linux 1 1.0 - - -");

        assert_eq!(machines.len(), 1);
        let m = &machines[0];
        assert!(m.ssh_key.is_none());
        assert!(m.supported_features.is_empty());
        assert!(m.mandatory_features.is_empty());
        assert!(m.public_host_key.is_none());
    }

    #[test]
    fn test_parse_defaults_for_missing_fields() {
        let machines = parse_machines("builder3 - x86_64-linux");

        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].max_jobs, 1);
        assert!((machines[0].speed_factor - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let machines = parse_machines(
            "# fleet of builders\n\nbuilder4 - x86_64-linux 2 1.0 # trailing comment\n   # indented comment\n",
        );

        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].ssh_name, "builder4");
        assert_eq!(machines[0].max_jobs, 2);
    }

    #[test]
    fn test_parse_skips_machine_without_systems() {
        let machines = parse_machines("broken - - 1 1.0");
        assert!(machines.is_empty());
    }

    #[tokio::test]
    async fn test_read_machines_file_resolves_includes() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().join("extra");
        std::fs::write(&extra, "builder6 - aarch64-linux 1 1.0\n").unwrap();
        let main = dir.path().join("machines");
        std::fs::write(
            &main,
            format!("builder5 - x86_64-linux 2 1.0\n@{}\n", extra.display()),
        )
        .unwrap();

        let content = read_machines_file(&main).await.unwrap();
        let machines = parse_machines(&content);
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].ssh_name, "builder5");
        assert_eq!(machines[1].ssh_name, "builder6");
    }
}
