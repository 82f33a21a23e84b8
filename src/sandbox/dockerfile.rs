//! Build-file augmentation: the user's file, unmodified, followed by our setup steps.

use anyhow::{Context, Result};
use minijinja::{AutoEscape, Environment, context};
use std::fs;

use super::{BuildSpec, SSH_PORT};

const SETUP_FRAGMENT: &str = r#"
# ---- vcoding setup ----
USER root
RUN set -eu; \
    if command -v apt-get >/dev/null 2>&1; then \
      export DEBIAN_FRONTEND=noninteractive; \
      apt-get update; \
      apt-get install -y --no-install-recommends openssh-server git ca-certificates curl bash{% if needs_node %} nodejs npm{% endif %}; \
      rm -rf /var/lib/apt/lists/*; \
    elif command -v apk >/dev/null 2>&1; then \
      apk add --no-cache openssh-server git ca-certificates curl bash shadow{% if needs_node %} nodejs npm{% endif %}; \
    else \
      echo "vcoding: base image needs apt-get or apk" >&2; exit 1; \
    fi
RUN set -eu; \
    id -u {{ user }} >/dev/null 2>&1 || useradd -m -s /bin/bash {{ user }}; \
    usermod -p '*' {{ user }}; \
    home=$(getent passwd {{ user }} | cut -d: -f6); \
    mkdir -p "$home/.ssh" {{ work_dir }}; \
    chmod 700 "$home/.ssh"; \
    chown -R {{ user }}:{{ user }} "$home/.ssh" {{ work_dir }}; \
    mkdir -p /run/sshd; \
    ssh-keygen -A; \
    { printf '%s\n' \
        'PasswordAuthentication no' \
        'KbdInteractiveAuthentication no' \
        'ChallengeResponseAuthentication no' \
        'PermitRootLogin no' \
        'PubkeyAuthentication yes' \
        'AllowUsers {{ user }}'; \
      cat /etc/ssh/sshd_config; } > /tmp/sshd_config; \
    mv /tmp/sshd_config /etc/ssh/sshd_config
{% for step in installs %}
RUN {{ step }}
{% endfor %}
WORKDIR {{ work_dir }}
EXPOSE {{ port }}
CMD ["/usr/sbin/sshd", "-D", "-e"]
"#;

/// Agent installers for the built-in agents, keyed by agent name.
pub fn builtin_install(agent: &str) -> Option<&'static str> {
    match agent {
        "claude" => Some("npm install -g @anthropic-ai/claude-code"),
        "copilot" => Some("npm install -g @github/copilot"),
        _ => None,
    }
}

/// Full build file text for `spec`.
pub fn render(spec: &BuildSpec) -> Result<String> {
    let base = match &spec.dockerfile {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read build file {}", path.display()))?,
        None => format!("FROM {}\n", spec.base_image),
    };

    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_keep_trailing_newline(true);
    let fragment = env
        .render_str(
            SETUP_FRAGMENT,
            context! {
                user => spec.user,
                work_dir => spec.work_dir,
                installs => spec.installs,
                needs_node => spec.installs.iter().any(|s| s.contains("npm ")),
                port => SSH_PORT,
            },
        )
        .context("Failed to render setup fragment")?;

    let mut text = base;
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(&fragment);
    Ok(text)
}
