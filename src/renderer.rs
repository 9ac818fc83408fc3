//! Config renderer
//!
//! Turns a ResolvedConfig into the proxy's configuration file syntax.
//! Pure and deterministic: identical input produces byte-identical output,
//! which is what the reload controller's change detection relies on.

use std::fmt::{self, Write};

use crate::resolver::{Location, ResolvedConfig, ResolvedServer};

/// Render one host's configuration file.
pub fn render(cfg: &ResolvedConfig) -> Vec<u8> {
    let mut out = String::new();
    render_config(&mut out, cfg).expect("formatting into a String should succeed");
    out.into_bytes()
}

fn render_config(out: &mut String, cfg: &ResolvedConfig) -> fmt::Result {
    for upstream in &cfg.upstreams {
        writeln!(out, "upstream {} {{", upstream.name)?;
        if !upstream.lb_method.is_empty() {
            writeln!(out, "    {};", upstream.lb_method)?;
        }
        for server in &upstream.servers {
            writeln!(
                out,
                "    server {} max_fails={} fail_timeout={};",
                server.address, server.max_fails, server.fail_timeout
            )?;
        }
        if upstream.keepalive > 0 {
            writeln!(out, "    keepalive {};", upstream.keepalive)?;
        }
        writeln!(out, "}}")?;
        writeln!(out)?;
    }

    for sc in &cfg.split_clients {
        writeln!(out, "split_clients {} {} {{", sc.source, sc.variable)?;
        for d in &sc.distributions {
            writeln!(out, "    {} {};", d.weight, d.value)?;
        }
        writeln!(out, "}}")?;
        writeln!(out)?;
    }

    for map in &cfg.maps {
        writeln!(out, "map {} {} {{", map.source, map.variable)?;
        for p in &map.parameters {
            writeln!(out, "    {} {};", p.value, p.result)?;
        }
        writeln!(out, "}}")?;
        writeln!(out)?;
    }

    render_server(out, &cfg.server)
}

fn render_server(out: &mut String, server: &ResolvedServer) -> fmt::Result {
    let proxy_protocol = if server.proxy_protocol {
        " proxy_protocol"
    } else {
        ""
    };

    writeln!(out, "server {{")?;
    writeln!(out, "    listen 80{};", proxy_protocol)?;

    if let Some(ssl) = &server.ssl {
        let http2 = if ssl.http2 { " http2" } else { "" };
        writeln!(out, "    listen 443 ssl{}{};", http2, proxy_protocol)?;
    }
    writeln!(out)?;

    writeln!(out, "    server_name {};", server.server_name)?;
    writeln!(out, "    server_tokens {};", server.server_tokens)?;

    if let Some(ssl) = &server.ssl {
        writeln!(out)?;
        writeln!(out, "    ssl_certificate {};", ssl.certificate)?;
        writeln!(out, "    ssl_certificate_key {};", ssl.certificate_key)?;
        if !ssl.ciphers.is_empty() {
            writeln!(out, "    ssl_ciphers {};", ssl.ciphers)?;
        }
    }

    if !server.snippets.is_empty() {
        writeln!(out)?;
        for snippet in &server.snippets {
            writeln!(out, "    {}", snippet)?;
        }
    }

    for redirect in &server.internal_redirects {
        writeln!(out)?;
        writeln!(out, "    location {} {{", redirect.path)?;
        writeln!(out, "        error_page 418 = {};", redirect.destination)?;
        writeln!(out, "        return 418;")?;
        writeln!(out, "    }}")?;
    }

    for location in &server.locations {
        writeln!(out)?;
        render_location(out, location)?;
    }

    writeln!(out, "}}")
}

fn render_location(out: &mut String, location: &Location) -> fmt::Result {
    writeln!(out, "    location {} {{", location.path)?;
    for snippet in &location.snippets {
        writeln!(out, "        {}", snippet)?;
    }
    writeln!(
        out,
        "        proxy_connect_timeout {};",
        location.proxy_connect_timeout
    )?;
    writeln!(
        out,
        "        proxy_read_timeout {};",
        location.proxy_read_timeout
    )?;
    writeln!(
        out,
        "        proxy_send_timeout {};",
        location.proxy_send_timeout
    )?;
    writeln!(
        out,
        "        client_max_body_size {};",
        location.client_max_body_size
    )?;
    if !location.proxy_buffering {
        writeln!(out, "        proxy_buffering off;")?;
    }
    if location.has_keepalive {
        // keepalive to the upstream requires HTTP/1.1 and a cleared
        // Connection header
        writeln!(out, "        proxy_http_version 1.1;")?;
        writeln!(out, "        proxy_set_header Connection \"\";")?;
    }
    writeln!(out, "        proxy_pass {};", location.proxy_pass)?;
    writeln!(out, "    }}")
}
