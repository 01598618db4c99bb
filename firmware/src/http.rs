//! HTTP control surface on port 80.
//!
//! A deliberately small HTTP/1.1 subset: one request per connection,
//! request line + headers, optional body. Handlers are adapters onto
//! [`crate::app::App`]; application-level failures still answer 200 with
//! a JSON error body, malformed requests get a 400.

use core::fmt::Write as _;

use embassy_net::tcp::TcpSocket;
use embassy_net::{IpListenEndpoint, Stack};
use embedded_io_async::Write;
use heapless::String;

use meshprobe_core::ble::Addr;
use meshprobe_core::ihex;
use meshprobe_core::loader::{Coalescer, FlashLoader, Kind, Progress, ProgressSink};

use crate::app::{err_json, nvmc_code, App, BleCommand, Json};

const HTTP_PORT: u16 = 80;
const HEAD_MAX: usize = 1024;

const INDEX_HTML: &str = include_str!("../static/index.html");

struct AppProgress<'a>(&'a App);

impl ProgressSink for AppProgress<'_> {
    fn update(&self, progress: &Progress) {
        self.0.set_progress(progress);
    }
}

#[embassy_executor::task]
pub async fn http_task(stack: Stack<'static>, app: &'static App) -> ! {
    let mut rx_buffer = [0u8; 2048];
    let mut tx_buffer = [0u8; 2048];
    loop {
        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(embassy_time::Duration::from_secs(30)));

        if let Err(e) = socket
            .accept(IpListenEndpoint {
                addr: None,
                port: HTTP_PORT,
            })
            .await
        {
            log::warn!("http accept failed: {:?}", e);
            continue;
        }

        handle_connection(&mut socket, app).await;
        socket.close();
        // let the FIN drain before the buffers are reused
        let _ = socket.flush().await;
        socket.abort();
    }
}

async fn handle_connection(socket: &mut TcpSocket<'_>, app: &'static App) {
    let mut head = [0u8; HEAD_MAX];
    let mut head_len = 0usize;

    // read until the blank line that ends the headers
    let body_start = loop {
        if head_len == head.len() {
            let _ = respond(socket, 400, "text/plain", b"header overflow").await;
            return;
        }
        match socket.read(&mut head[head_len..]).await {
            Ok(0) => return,
            Ok(n) => {
                head_len += n;
                if let Some(at) = find(&head[..head_len], b"\r\n\r\n") {
                    break at + 4;
                }
            }
            Err(_) => return,
        }
    };

    let Some((method, path_query)) = parse_request_line(&head[..body_start]) else {
        let _ = respond(socket, 400, "text/plain", b"bad request line").await;
        return;
    };
    let (path, query) = match find(path_query, b"?") {
        Some(at) => (&path_query[..at], &path_query[at + 1..]),
        None => (path_query, &b""[..]),
    };
    let content_length = header_value(&head[..body_start], b"content-length")
        .and_then(|v| parse_usize(v))
        .unwrap_or(0);

    log::debug!(
        "http {} {}",
        core::str::from_utf8(method).unwrap_or("?"),
        core::str::from_utf8(path).unwrap_or("?")
    );

    match (method, path) {
        (b"GET", b"/") => {
            let _ = respond(socket, 200, "text/html", INDEX_HTML.as_bytes()).await;
        }
        (b"GET", b"/check_swd") => {
            let json = app.check_swd().await;
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"GET", b"/release_swd") => {
            let text = app.release_swd().await;
            let _ = respond(socket, 200, "text/plain", text.as_bytes()).await;
        }
        (b"GET", b"/erase_all") => {
            let json = app.erase_all().await;
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"GET", b"/mass_erase") => {
            let json = app.mass_erase().await;
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"GET", b"/disable_protection") => {
            let json = app.disable_protection().await;
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"GET", b"/progress") => {
            let json = app.progress_json();
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/upload") => {
            let kind = query_param(query, b"type")
                .and_then(|v| core::str::from_utf8(v).ok())
                .and_then(Kind::from_query);
            let Some(kind) = kind else {
                let _ = respond(socket, 400, "text/plain", b"unknown upload type").await;
                return;
            };
            let body = &head[body_start..head_len];
            let json = upload(socket, app, kind, body, content_length).await;
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/ble/connect") => {
            let body = &head[body_start..head_len];
            let json = match body_param(body, b"addr").and_then(parse_addr) {
                Some(addr) => app.ble_command(BleCommand::Connect(addr)),
                None => {
                    let _ = respond(socket, 400, "text/plain", b"addr missing").await;
                    return;
                }
            };
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/ble/disconnect") => {
            let json = app.ble_command(BleCommand::Disconnect);
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"GET", b"/ble/conn_status") => {
            let json = app.ble_status_json();
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/ble/passkey") => {
            let json = match query_param(query, b"pin").and_then(parse_usize) {
                Some(pin) if pin <= 999_999 => app.ble_command(BleCommand::Passkey(pin as u32)),
                _ => {
                    let _ = respond(socket, 400, "text/plain", b"pin must be 6 digits").await;
                    return;
                }
            };
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/ble/scan") => {
            let json = app.ble_command(BleCommand::StartScan);
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/ble/stop_scan") => {
            let json = app.ble_command(BleCommand::StopScan);
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/ble/devices") | (b"GET", b"/ble/devices") => {
            let json = app.scan_results_json();
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/ble/clear") => {
            let json = app.clear_scan_results();
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/power_on") => {
            let json = app.power_set(true).await;
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/power_off") => {
            let json = app.power_set(false).await;
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        (b"POST", b"/power_reboot") => {
            let json = app.power_reboot().await;
            let _ = respond(socket, 200, "application/json", json.as_bytes()).await;
        }
        _ => {
            let _ = respond(socket, 404, "text/plain", b"no such endpoint").await;
        }
    }
}

/// Stream the HEX body straight into the flash path while it arrives.
async fn upload(
    socket: &mut TcpSocket<'_>,
    app: &'static App,
    kind: Kind,
    first_chunk: &[u8],
    content_length: usize,
) -> Json {
    let mut target = app.swd.lock().await;
    if !target.is_connected() {
        if let Err(e) = target.connect() {
            return err_json(crate::app::target_code(&e), "target not responding");
        }
    }

    let sink = AppProgress(app);
    let mut loader = FlashLoader::new(&mut target, content_length as u32, &sink);
    let mut parser = ihex::Parser::with_base(kind.default_base());
    let mut received = first_chunk.len();

    let result = {
        let mut coalescer = Coalescer::new(|base, data: &[u8]| loader.flush(base, data));
        let mut feed = parser.feed(first_chunk, &mut coalescer);

        let mut buf = [0u8; 512];
        while feed.is_ok() && !parser.eof_seen() && (content_length == 0 || received < content_length)
        {
            match socket.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    received += n;
                    feed = parser.feed(&buf[..n], &mut coalescer);
                }
                Err(_) => {
                    feed = Err(ihex::Error::Length);
                    break;
                }
            }
        }
        if feed.is_ok() {
            feed = parser.finish(&mut coalescer);
        }
        feed
    };

    loader.note_received(received as u32);
    match result {
        Ok(()) if parser.eof_seen() => {
            loader.finish("flash complete");
            let flashed = loader.progress().flashed;
            drop(loader);
            let mut out = Json::new();
            let _ = write!(
                out,
                "{{\"success\":true,\"message\":\"flashed {} bytes\"}}",
                flashed
            );
            out
        }
        Ok(()) => {
            loader.finish("stream ended before EOF record");
            err_json("hex_truncated", "stream ended before EOF record")
        }
        Err(e) => {
            let (code, message): (&str, &str) = match &e {
                ihex::Error::Checksum => ("hex_checksum", "record checksum mismatch"),
                ihex::Error::Length => ("hex_length", "record length invalid"),
                ihex::Error::Syntax => ("hex_syntax", "malformed record"),
                ihex::Error::UnknownRecord(_) => ("hex_record", "unsupported record type"),
                ihex::Error::Sink(e) => (nvmc_code(e), "flash operation failed"),
            };
            loader.finish(message);
            app.record_error(code);
            err_json(code, message)
        }
    }
}

async fn respond(
    socket: &mut TcpSocket<'_>,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<(), ()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Error",
    };
    let mut head: String<128> = String::new();
    let _ = write!(
        head,
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    );
    socket.write_all(head.as_bytes()).await.map_err(|_| ())?;
    socket.write_all(body).await.map_err(|_| ())
}

fn parse_request_line(head: &[u8]) -> Option<(&[u8], &[u8])> {
    let line_end = find(head, b"\r\n")?;
    let line = &head[..line_end];
    let sp1 = find(line, b" ")?;
    let rest = &line[sp1 + 1..];
    let sp2 = find(rest, b" ")?;
    Some((&line[..sp1], &rest[..sp2]))
}

fn header_value<'a>(head: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    for line in head.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = find(line, b":") else {
            continue;
        };
        if line[..colon].eq_ignore_ascii_case(name) {
            let mut value = &line[colon + 1..];
            while value.first() == Some(&b' ') {
                value = &value[1..];
            }
            return Some(value);
        }
    }
    None
}

fn query_param<'a>(query: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    for pair in query.split(|&b| b == b'&') {
        if let Some(eq) = find(pair, b"=") {
            if &pair[..eq] == name {
                return Some(&pair[eq + 1..]);
            }
        }
    }
    None
}

fn body_param<'a>(body: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    query_param(body, name)
}

/// Device addresses arrive either literal or with `%3A` colons.
fn parse_addr(raw: &[u8]) -> Option<Addr> {
    let mut text: String<40> = String::new();
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' && raw.len() >= i + 3 && raw[i + 1..i + 3].eq_ignore_ascii_case(b"3a") {
            text.push(':').ok()?;
            i += 3;
        } else {
            text.push(raw[i] as char).ok()?;
            i += 1;
        }
    }
    Addr::parse(&text)
}

fn parse_usize(raw: &[u8]) -> Option<usize> {
    let text = core::str::from_utf8(raw).ok()?;
    text.trim().parse().ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}
