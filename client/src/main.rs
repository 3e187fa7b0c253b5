use clap::Parser;
use client::input::{Command, HELP};
use client::{GameOutcome, Node, NodeConfig, NodeEvent};
use log::{error, info};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about = "LSNP peer node", long_about = None)]
struct Args {
    /// User name; the identity becomes name@ip
    #[arg(short = 'n', long)]
    name: String,

    /// UDP port to bind
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Local ip to bind
    #[arg(short = 'b', long)]
    bind: Option<IpAddr>,

    /// Ip to advertise in the identity when binding a wildcard address
    #[arg(long)]
    advertise: Option<IpAddr>,

    /// Rendezvous server; peer-to-peer broadcast mode when omitted
    #[arg(short = 's', long)]
    server: Option<SocketAddr>,

    /// TOML config file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Accept every file offer without asking
    #[arg(long)]
    auto_accept: bool,

    /// Where received files are written
    #[arg(short = 'd', long)]
    download_dir: Option<PathBuf>,

    /// Log protocol traffic
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = NodeConfig::load(args.config.as_deref())?;
    if let Some(ip) = args.bind {
        config.bind.set_ip(ip);
    }
    if let Some(port) = args.port {
        config.bind.set_port(port);
    }
    if args.advertise.is_some() {
        config.advertise_ip = args.advertise;
    }
    if args.server.is_some() {
        config.server = args.server;
    }
    if args.auto_accept {
        config.auto_accept_files = true;
    }
    if args.download_dir.is_some() {
        config.download_dir = args.download_dir;
    }

    let (node, mut events) = Node::bind(config, &args.name).await?;
    info!("You are {}. Type `help` for commands.", node.user_id());

    let runner = node.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", describe(&event));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Ok(Command::Exit) => break,
                    Ok(command) => {
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(e) = execute(&node, command).await {
                                println!("! {}", e);
                            }
                        });
                    }
                    Err(e) => println!("! {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    node.shutdown();
    match run_handle.await {
        Ok(Err(e)) => error!("Node stopped with error: {}", e),
        Err(e) => error!("Node task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}

/// Accepts a full identity or a display name of a known peer
async fn lookup(node: &Node, name: &str) -> String {
    if name.contains('@') {
        return name.to_string();
    }
    node.resolve(name).await.unwrap_or_else(|| name.to_string())
}

async fn execute(node: &Node, command: Command) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match command {
        Command::Post(content) => {
            let id = node.post(&content).await?;
            println!("posted ({})", id);
        }
        Command::Dm { to, content } => {
            let to = lookup(node, &to).await;
            node.send_dm(&to, &content).await?;
            println!("delivered to {}", to);
        }
        Command::Follow(user) => {
            let user = lookup(node, &user).await;
            node.follow(&user).await?;
            println!("now following {}", user);
        }
        Command::Unfollow(user) => {
            let user = lookup(node, &user).await;
            node.unfollow(&user).await?;
            println!("unfollowed {}", user);
        }
        Command::Like {
            author,
            post_timestamp,
        } => {
            let author = lookup(node, &author).await;
            node.like(&author, &post_timestamp).await?;
        }
        Command::SendFile {
            to,
            path,
            description,
        } => {
            let to = lookup(node, &to).await;
            let data = tokio::fs::read(&path).await?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            let description = (!description.is_empty()).then_some(description);
            let file_id = node
                .send_file(&to, &filename, guess_mime(&path), data, description)
                .await?;
            println!("sent {} as {}", filename, file_id);
        }
        Command::Accept(file_id) => node.accept_file(&file_id).await?,
        Command::Ignore(file_id) => node.ignore_file(&file_id).await?,
        Command::Invite { to, symbol } => {
            let to = lookup(node, &to).await;
            let game_id = node.invite_game(&to, symbol).await?;
            println!("game {} started, you are {}", game_id, symbol);
        }
        Command::Move { game_id, position } => {
            let outcome = node.play_move(&game_id, position).await?;
            if let Some(game) = node.game(&game_id).await {
                println!("{}", game.render());
            }
            if outcome.is_none() {
                println!("waiting for opponent");
            }
        }
        Command::GroupCreate { name, members } => {
            let mut resolved = Vec::with_capacity(members.len());
            for member in members {
                resolved.push(lookup(node, &member).await);
            }
            let group_id = node.create_group(&name, resolved).await?;
            println!("group {} created as {}", name, group_id);
        }
        Command::GroupAdd { group_id, members } => {
            node.update_group(&group_id, members, Vec::new()).await?
        }
        Command::GroupRemove { group_id, members } => {
            node.update_group(&group_id, Vec::new(), members).await?
        }
        Command::GroupSend { group_id, content } => {
            let missed = node.send_group_message(&group_id, &content).await?;
            if !missed.is_empty() {
                println!("not delivered to {}", missed.join(", "));
            }
        }
        Command::Revoke(token) => node.revoke_token(&token).await,
        Command::Peers => {
            for peer in node.peers().await {
                println!("  {} ({}) {} - {}", peer.display_name, peer.user_id, peer.addr, peer.status);
            }
        }
        Command::Transfers => {
            for transfer in node.transfers().await {
                println!("  {:?}", transfer);
            }
        }
        Command::Help => println!("{}", HELP),
        Command::Exit => {}
    }
    Ok(())
}

fn describe(event: &NodeEvent) -> String {
    match event {
        NodeEvent::PeerDiscovered {
            user_id,
            display_name,
        } => format!("+ {} ({}) is online", display_name, user_id),
        NodeEvent::ProfileUpdated {
            display_name,
            status,
            ..
        } => format!("~ {} is now: {}", display_name, status),
        NodeEvent::PeerLost { user_id } => format!("- {} went offline", user_id),
        NodeEvent::Welcomed { peers } => format!("* registered, {} peers online", peers.len()),
        NodeEvent::PostReceived {
            author, content, ..
        } => format!("[post] {}: {}", author, content),
        NodeEvent::PostLiked {
            from,
            post_timestamp,
        } => format!("[like] {} liked your post {}", from, post_timestamp),
        NodeEvent::DirectMessage { from, content, .. } => format!("[dm] {}: {}", from, content),
        NodeEvent::Followed { follower } => format!("* {} followed you", follower),
        NodeEvent::Unfollowed { follower } => format!("* {} unfollowed you", follower),
        NodeEvent::FileOffered { from, offer } => format!(
            "[file] {} offers {} ({} bytes), `accept {}` or `ignore {}`",
            from, offer.filename, offer.filesize, offer.file_id, offer.file_id
        ),
        NodeEvent::FileReceived(file) => format!(
            "[file] received {} ({} bytes) from {}",
            file.filename,
            file.data.len(),
            file.sender
        ),
        NodeEvent::FileDelivered { file_id, status } => {
            format!("[file] {} settled: {}", file_id, status)
        }
        NodeEvent::FileIgnored { file_id } => format!("[file] {} ignored", file_id),
        NodeEvent::FileFailed { file_id } => format!("[file] {} timed out", file_id),
        NodeEvent::GameInvited {
            game_id,
            from,
            symbol,
        } => format!(
            "[game] {} invited you to {}, you play {}",
            from, game_id, symbol
        ),
        NodeEvent::GameMoved { game_id, mv } => format!(
            "[game] {} turn {}: {} takes {}",
            game_id, mv.turn, mv.symbol, mv.position
        ),
        NodeEvent::GameOver { game_id, outcome } => match outcome {
            GameOutcome::Win { symbol, line } => {
                format!("[game] {} over: {} wins on {:?}", game_id, symbol, line)
            }
            GameOutcome::Draw => format!("[game] {} over: draw", game_id),
        },
        NodeEvent::GroupJoined {
            group_id,
            name,
            members,
        } => format!(
            "[group] joined {} ({}) with {}",
            name,
            group_id,
            members.join(", ")
        ),
        NodeEvent::GroupUpdated { group_id, members } => {
            format!("[group] {} members: {}", group_id, members.join(", "))
        }
        NodeEvent::GroupMessage {
            group_id,
            from,
            content,
        } => format!("[group {}] {}: {}", group_id, from, content),
        NodeEvent::DeliveryFailed { message_id, to } => {
            format!("! {} never acknowledged {}", to, message_id)
        }
        NodeEvent::TokenRevoked { token } => format!("* token revoked: {}", token),
    }
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt") | Some("md") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
