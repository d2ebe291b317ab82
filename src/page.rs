//! HTML of the status page
//!
//! Rendering is a pure function of a [`StatusSnapshot`]; the handler gathers
//! the snapshot under the state locks and renders after releasing them.

use crate::services::{knx_mode::KnxMode, telemetry::TelemetryEntry};
use std::{fmt::Write, time::Duration};

const STYLE: &str = "html {font-family: Helvetica; display: inline-block; color: #444444; text-align: center;}
h1 {margin: 50px auto 30px;}
.button {display: inline-block;width: 80px;background-color: #3498db;border: none;color: white;padding: 13px 30px;text-decoration: none;font-size: 25px;margin: 0px 5px 35px 5px;cursor: pointer;border-radius: 4px;}
.button-blue {background-color: #3498db; cursor: not-allowed ;}
.button-dark {background-color: #34495e;}
.button-dark:active {background-color: #2c3e50;}
.warning {color: #a93226;}
p {font-size: 14px;color: #888;margin-bottom: 10px;}
";

#[derive(Clone, Debug, Default)]
pub struct StatusSnapshot {
    pub hostname: String,
    pub knx_phys_addr: String,
    pub knx_config_ok: bool,
    /// `None` hides the mode buttons
    pub mode: Option<KnxMode>,
    /// Time left in the update window, `None` while it is closed
    pub ota_remaining: Option<Duration>,
    pub auth_required: bool,
    pub tft_update: bool,
    pub tft_debug: bool,
    pub telemetry_title: String,
    pub telemetry: Vec<TelemetryEntry>,
}

pub fn render_status(snapshot: &StatusSnapshot) -> Result<String, std::fmt::Error> {
    let mut html = String::with_capacity(4096);
    write_status(&mut html, snapshot)?;
    Ok(html)
}

fn write_status(html: &mut String, s: &StatusSnapshot) -> std::fmt::Result {
    let hostname = escape(&s.hostname);

    writeln!(html, "<!DOCTYPE html><html>")?;
    writeln!(
        html,
        "<head><meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0, user-scalable=no\">"
    )?;
    writeln!(html, "<title>{hostname}</title>")?;
    writeln!(html, "<link rel=\"icon\" type=\"image/png\" href=\"/favicon.ico\">")?;
    writeln!(html, "<style>{STYLE}</style>")?;
    writeln!(html, "</head>")?;
    writeln!(html, "<body>")?;
    write!(html, "<h1>KNX Gateway</h1>")?;
    write!(html, "<h3>Name: {hostname}</h3>")?;
    writeln!(html, "<h3>Physical address: {}</h3>", escape(&s.knx_phys_addr))?;

    if !s.knx_config_ok {
        writeln!(html, "<h3 class=\"warning\">KNX configuration incomplete!</h3>")?;
    }

    if let Some(mode) = s.mode {
        write!(html, "<p>KNX Mode:</p>")?;
        for (button, href) in [
            (KnxMode::Prog, "/progmode"),
            (KnxMode::Normal, "/normalmode"),
            (KnxMode::Off, "/knxoff"),
        ] {
            if button == mode {
                write!(html, "<a class=\"button button-blue\">{button}</a>")?;
            } else {
                write!(html, "<a class=\"button button-dark\" href=\"{href}\">{button}</a>")?;
            }
        }
        writeln!(html)?;
    }

    match s.ota_remaining {
        Some(remaining) => {
            write!(
                html,
                "<script>var t={};var x=setInterval(function(){{var m=Math.floor(t/60);var s=t%60;\
                 document.getElementById(\"timer\").innerHTML=m+\"m \"+s+\"s\";t--;\
                 if(t<0){{clearInterval(x);location.reload();}}}},1000);</script>",
                remaining.as_secs()
            )?;
            writeln!(
                html,
                "<p>OTA: <span id=\"timer\"></span></p><a class=\"button button-blue\">ON</a>\
                 <a class=\"button button-dark\" href=\"/otaoff\">OFF</a>"
            )?;
        }
        None => writeln!(
            html,
            "<p>OTA:</p><a class=\"button button-dark\" href=\"/otaon\">ON</a>\
             <a class=\"button button-blue\">OFF</a>"
        )?,
    }

    write!(
        html,
        "<p>System:</p><a class=\"button button-dark\" href=\"/restart\">Restart</a>\
         <a class=\"button button-dark\" href=\"/webupdate\">Update</a>"
    )?;

    if s.tft_update {
        write!(html, "<a class=\"button button-dark\" href=\"/tftupdate\">TFT Update</a>")?;
    }

    if s.tft_debug {
        write!(html, "<a class=\"button button-dark\" href=\"/tftdebug\">TFT Debug</a>")?;
    }

    if s.auth_required {
        write!(
            html,
            "<a class=\"button button-dark\" onclick=\"window.open('http://logout@'+window.location.host,'_self');\">Logout</a>"
        )?;
    }
    writeln!(html)?;

    if !s.telemetry.is_empty() {
        write!(html, "<h3>{}</h3><p>", escape(&s.telemetry_title))?;
        let last = s.telemetry.len() - 1;
        for (i, entry) in s.telemetry.iter().enumerate() {
            write!(html, "{}: {}", escape(&entry.label), escape(&entry.value))?;
            if i != last {
                write!(html, "<br>")?;
            }
        }
        writeln!(html, "</p>")?;
    }

    writeln!(html, "</body>")?;
    writeln!(html, "</html>")
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());

    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }

    escaped
}
