//! reprise CLI: clip player and downloader powered by the reprise engine.
//!
//! Commands:
//!   reprise play <uri> [options]   Play a file or URL
//!       --clip <start_ms> <end_ms>   Play only this window (-1 end = to EOF)
//!       --loop <n>                   Play the window n times (-1 = forever)
//!       --speed <x>                  Playback speed multiplier
//!       --volume <0-100>             Output volume
//!       --cache                      Cache the URL while playing
//!   reprise download <url> [title]  Download a URL into the cache
//!   reprise downloads               List known downloads
//!   reprise remove <url>            Remove a cached download
//!   reprise clear-cache             Delete every cached file
//!   reprise watch                   Print scroll changes as they happen

use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use nine_s_shell::Shell;
use reprise_core::models::download::download_id;
use reprise_core::{paths, Download, DownloadRequest, Engine, MethodCall, PlayerEvent, SinkMessage};
use serde_json::{json, Value};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return;
    }

    // 9S root defaults to ~/.reprise
    if std::env::var("NINE_S_ROOT").is_err() {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        let root = format!("{}/.reprise", home);
        std::fs::create_dir_all(&root).ok();
        std::env::set_var("NINE_S_ROOT", &root);
    }

    let shell = Shell::open("reprise", &[]).expect("failed to open 9S shell");
    let engine = Engine::new(shell);

    match args[0].as_str() {
        "play" => cmd_play(&engine, &args[1..]),
        "download" => cmd_download(&engine, &args[1..]),
        "downloads" => cmd_downloads(&engine),
        "remove" => cmd_remove(&engine, &args[1..]),
        "clear-cache" => cmd_clear_cache(&engine),
        "watch" => cmd_watch(&engine),
        other => {
            eprintln!("unknown command: {}", other);
            print_usage();
        }
    }

    engine.shutdown();
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

struct PlayArgs {
    uri: String,
    clip: Option<(i64, i64)>,
    loops: i64,
    speed: Option<f64>,
    volume: Option<f64>,
    cache: bool,
}

fn parse_play_args(args: &[String]) -> Result<PlayArgs, String> {
    let uri = args.first().ok_or("missing <uri>")?.clone();
    let mut play = PlayArgs {
        uri,
        clip: None,
        loops: 0,
        speed: None,
        volume: None,
        cache: false,
    };

    let mut rest = args[1..].iter();
    while let Some(flag) = rest.next() {
        match flag.as_str() {
            "--clip" => {
                let start = parse_next::<i64>(&mut rest, "--clip")?;
                let end = parse_next::<i64>(&mut rest, "--clip")?;
                play.clip = Some((start, end));
            }
            "--loop" => play.loops = parse_next(&mut rest, "--loop")?,
            "--speed" => play.speed = Some(parse_next(&mut rest, "--speed")?),
            "--volume" => {
                let v: u32 = parse_next(&mut rest, "--volume")?;
                play.volume = Some(v.min(100) as f64 / 100.0);
            }
            "--cache" => play.cache = true,
            other => return Err(format!("unknown option: {}", other)),
        }
    }
    Ok(play)
}

fn parse_next<'a, T: std::str::FromStr>(
    rest: &mut impl Iterator<Item = &'a String>,
    flag: &str,
) -> Result<T, String> {
    rest.next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| format!("{} needs a numeric value", flag))
}

fn cmd_play(engine: &Engine, args: &[String]) {
    let play = match parse_play_args(args) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("usage: reprise play <uri> [--clip s e] [--loop n] [--speed x] [--volume v] [--cache]");
            return;
        }
    };

    // Heartbeat drives the player's events
    engine.start();

    let mut create = json!({ "uri": play.uri, "loopingTimes": play.loops, "autoCache": play.cache });
    if let Some((start, end)) = play.clip {
        create["clipRange"] = json!([start, end]);
    }
    let id = match call(engine, "create", create) {
        Ok(v) => v["playerId"].as_str().unwrap_or_default().to_string(),
        Err(e) => {
            eprintln!("create failed: {}", e);
            return;
        }
    };
    let rx = match engine.listen_channel(&id) {
        Ok(rx) => rx,
        Err(e) => {
            eprintln!("listen failed: {}", e);
            return;
        }
    };

    if let Some(volume) = play.volume {
        call(engine, "setVolume", json!({ "playerId": id, "volume": volume })).ok();
    }
    if let Err(e) = call(engine, "play", json!({ "playerId": id })) {
        eprintln!("play failed: {}", e);
        return;
    }

    // Block showing progress until the clip completes (Ctrl+C exits)
    let mut duration = 0;
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(SinkMessage::Success { event }) => match event {
                PlayerEvent::Initialized { duration: d } => {
                    duration = d;
                    // Speed applies once the source is ready
                    if let Some(speed) = play.speed {
                        call(engine, "setSpeed", json!({ "playerId": id, "speed": speed })).ok();
                    }
                }
                PlayerEvent::Completed => break,
                _ => {}
            },
            Ok(SinkMessage::Error { code, message, .. }) => {
                println!();
                eprintln!("{}: {}", code, message);
                break;
            }
            Ok(SinkMessage::EndOfStream) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let pos = call(engine, "position", json!({ "playerId": id }))
            .ok()
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        print_progress(&play.uri, pos, duration);
    }
    println!();
}

fn cmd_download(engine: &Engine, args: &[String]) {
    let url = match args.first() {
        Some(u) => u,
        None => {
            eprintln!("usage: reprise download <url> [title]");
            return;
        }
    };
    let title = args.get(1).map(String::as_str).unwrap_or("");

    engine.start();
    if let Err(e) = engine.downloads().add_download(DownloadRequest::new(url, title)) {
        eprintln!("download failed: {}", e);
        return;
    }

    let id = download_id(url);
    loop {
        std::thread::sleep(Duration::from_millis(250));
        let Some(download) = engine.downloads().download(&id) else {
            println!();
            eprintln!("download disappeared: {}", url);
            return;
        };
        print_download(&download);
        if download.is_terminal() {
            break;
        }
    }
    println!();
}

fn cmd_downloads(engine: &Engine) {
    let downloads = engine.downloads().downloads();
    if downloads.is_empty() {
        println!("no downloads");
        return;
    }
    for download in &downloads {
        print_download(download);
        println!();
    }
}

fn cmd_remove(engine: &Engine, args: &[String]) {
    let url = match args.first() {
        Some(u) => u,
        None => {
            eprintln!("usage: reprise remove <url>");
            return;
        }
    };
    // Removal runs on the downloads worker
    engine.start();
    let id = download_id(url);
    if engine.downloads().download(&id).is_none() {
        println!("not downloaded: {}", url);
        return;
    }
    if let Err(e) = engine.downloads().remove_download(&id) {
        eprintln!("remove failed: {}", e);
        return;
    }
    while engine.downloads().download(&id).is_some() {
        std::thread::sleep(Duration::from_millis(50));
    }
    println!("removed: {}", url);
}

fn cmd_clear_cache(engine: &Engine) {
    match call(engine, "clearCache", Value::Null) {
        Ok(_) => println!("cache cleared: {}", engine.config().cache_dir.display()),
        Err(e) => eprintln!("clear failed: {}", e),
    }
}

fn cmd_watch(engine: &Engine) {
    let rx = match engine.shell().on(paths::WATCH_ALL) {
        Ok(rx) => rx,
        Err(e) => {
            eprintln!("watch failed: {}", e);
            return;
        }
    };
    println!("watching {} (Ctrl+C to stop)", paths::WATCH_ALL);
    for scroll in rx.iter() {
        println!("{}  {}", scroll.key, scroll.data);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn call(engine: &Engine, method: &str, args: Value) -> Result<Value, String> {
    engine
        .handle(&MethodCall::new(method, args))
        .map_err(|e| format!("{} ({})", e, e.code()))
}

fn print_download(download: &Download) {
    let title = download.request.title();
    let name = if title.is_empty() { download.request.uri.as_str() } else { title.as_str() };
    let percent = download.percent_downloaded();
    let progress = if percent < 0.0 {
        format!("{} bytes", download.bytes_downloaded)
    } else {
        format!("{:.0}%", percent)
    };
    print!(
        "\r  {}  {:?}  {}  {}    ",
        download.request.id, download.state, progress, name
    );
    if let Some(reason) = &download.failure_reason {
        print!("({})", reason);
    }
    use std::io::Write;
    std::io::stdout().flush().ok();
}

fn print_progress(title: &str, pos_ms: u64, dur_ms: u64) {
    let bar_width = 30;
    let filled = if dur_ms > 0 {
        (((pos_ms as f64 / dur_ms as f64) * bar_width as f64) as usize).min(bar_width)
    } else {
        0
    };
    let empty = bar_width - filled;

    print!(
        "\r  {}  [{}{}] {} / {}    ",
        title,
        "=".repeat(filled),
        " ".repeat(empty),
        fmt_time(pos_ms),
        fmt_time(dur_ms),
    );
    use std::io::Write;
    std::io::stdout().flush().ok();
}

fn fmt_time(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn print_usage() {
    println!("reprise - CLI clip player and downloader");
    println!();
    println!("usage: reprise <command> [args]");
    println!();
    println!("commands:");
    println!("  play <uri> [options]         Play a file or URL");
    println!("    --clip <start_ms> <end_ms>   Play only this window (-1 end = to EOF)");
    println!("    --loop <n>                   Play the window n times (-1 = forever)");
    println!("    --speed <x>                  Playback speed multiplier");
    println!("    --volume <0-100>             Output volume");
    println!("    --cache                      Cache the URL while playing");
    println!("  download <url> [title]       Download a URL into the cache");
    println!("  downloads                    List known downloads");
    println!("  remove <url>                 Remove a cached download");
    println!("  clear-cache                  Delete every cached file");
    println!("  watch                        Print scroll changes as they happen");
}
