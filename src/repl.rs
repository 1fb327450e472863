//! Interactive command loop
//!
//! Reads commands line by line and drives a [`Node`]: `register`, `login`,
//! `connect`, `status`, `show chat`, `end chat`, `logout` and `exit`. Each
//! command prompts for what it needs. Failures are reported and the loop
//! carries on; only `exit` or the end of input stops it.
//!
//! While waiting for a command the loop also prints lines that arrive for
//! the active chat. During `connect` it prints the connected peer's lines
//! as well.

use crate::node::{Node, PeerEvent};
use crate::outbound::ChatEnd;
use crate::{net, Error, Result};
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

const COMMAND_HELP: &str =
    "Available commands: register | login | connect | status | show chat | end chat | logout | exit";

/// A command-loop command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Register a username and port with the directory
    Register,
    /// Log in and start listening
    Login,
    /// Dial a peer and chat with it
    Connect,
    /// List friends with unread markers
    Status,
    /// Print a conversation and make it the active chat
    ShowChat,
    /// Move a conversation to the background
    EndChat,
    /// Stop listening and clear the session
    Logout,
    /// Log out and leave the loop
    Exit,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        match normalized.as_str() {
            "register" => Ok(Command::Register),
            "login" => Ok(Command::Login),
            "connect" => Ok(Command::Connect),
            "status" => Ok(Command::Status),
            "show chat" => Ok(Command::ShowChat),
            "end chat" => Ok(Command::EndChat),
            "logout" => Ok(Command::Logout),
            "exit" => Ok(Command::Exit),
            _ => Err(Error::Protocol(format!("unknown command {:?}", s.trim()))),
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Command loop over an input and an output stream
pub struct Repl<R, W> {
    node: Node,
    input: Lines<R>,
    out: W,
    events: Option<broadcast::Receiver<PeerEvent>>,
}

impl<R, W> Repl<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a loop driving `node`
    pub fn new(node: Node, input: R, out: W) -> Self {
        let events = Some(node.subscribe());
        Self {
            node,
            input: input.lines(),
            out,
            events,
        }
    }

    /// Run until `exit` or end of input
    ///
    /// Any active session is logged out before returning.
    pub async fn run(mut self) -> Result<()> {
        self.say(COMMAND_HELP).await?;

        loop {
            self.prompt("Command: ").await?;
            let Some(line) = self.next_command_line().await? else {
                debug!("Input closed");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let command = match line.parse::<Command>() {
                Ok(command) => command,
                Err(_) => {
                    self.say("Unknown command! Please try again.").await?;
                    self.say(COMMAND_HELP).await?;
                    continue;
                }
            };

            if let Flow::Exit = self.execute(command).await? {
                break;
            }
        }

        if self.node.logout().await.is_some() {
            info!("Logged out on exit");
        }
        Ok(())
    }

    /// Wait for the next input line, printing peer events meanwhile
    async fn next_command_line(&mut self) -> Result<Option<String>> {
        loop {
            let event = match self.events.as_mut() {
                Some(events) => tokio::select! {
                    line = self.input.next_line() => return Ok(line?),
                    event = events.recv() => event,
                },
                None => return Ok(self.input.next_line().await?),
            };

            match event {
                Ok(event) => self.show_event(event).await?,
                Err(RecvError::Lagged(missed)) => debug!("Missed {} peer events", missed),
                Err(RecvError::Closed) => self.events = None,
            }
        }
    }

    async fn show_event(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Message {
                from,
                text,
                chat_active: true,
            } => self.say(&format!("\n[{}]: {}", from, text)).await,
            PeerEvent::Message { .. } => Ok(()),
            PeerEvent::Connected { username, addr } => {
                self.say(&format!("\n{} connected from {}", username, addr)).await
            }
            PeerEvent::Disconnected { username } => self.say(&format!("\n{} disconnected", username)).await,
        }
    }

    /// Run one command
    async fn execute(&mut self, command: Command) -> Result<Flow> {
        debug!("Command {:?}", command);
        match command {
            Command::Register => self.register().await?,
            Command::Login => self.login().await?,
            Command::Connect => self.connect().await?,
            Command::Status => self.status().await?,
            Command::ShowChat => self.show_chat().await?,
            Command::EndChat => self.end_chat().await?,
            Command::Logout => self.logout().await?,
            Command::Exit => {
                self.say("Exiting application...").await?;
                return Ok(Flow::Exit);
            }
        }
        Ok(Flow::Continue)
    }

    async fn register(&mut self) -> Result<()> {
        if self.node.session().is_logged_in().await {
            return self.say("Logout first to register again").await;
        }

        let Some(username) = self.ask("Choose username: ").await? else {
            return Ok(());
        };
        let Some(port) = self.ask("Choose port: ").await? else {
            return Ok(());
        };
        let port = match port.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return self.say("Invalid port, please enter a number").await,
        };

        let ip = match &self.node.settings().advertise_ip {
            Some(ip) => ip.clone(),
            None => net::local_ip().to_string(),
        };

        match self.node.register(&username, &ip, port).await {
            Ok(_) => self.say(&format!("Registered {} at {}:{}", username, ip, port)).await,
            Err(e) => self.say(&format!("Registration failed: {}", e)).await,
        }
    }

    async fn login(&mut self) -> Result<()> {
        if let Some(identity) = self.node.session().identity().await {
            return self.say(&format!("Already logged in as {}", identity.username)).await;
        }

        let Some(username) = self.ask("Enter your username: ").await? else {
            return Ok(());
        };

        match self.node.login(&username).await {
            Ok(summary) => {
                self.say(&format!("Login successful, listening on {}", summary.listen_addr))
                    .await?;
                if summary.friends.is_empty() {
                    self.say("No friends yet").await
                } else {
                    self.say(&format!("Friends: {}", summary.friends.join(", "))).await
                }
            }
            Err(Error::UnknownUser(_)) => self.say("Username not found").await,
            Err(e) => self.say(&format!("Login failed: {}", e)).await,
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if !self.node.session().is_logged_in().await {
            return self.say("Login first").await;
        }

        let Some(peer) = self.ask("Enter peer username to connect: ").await? else {
            return Ok(());
        };

        let session = match self.node.connect(&peer).await {
            Ok(session) => session,
            Err(Error::UnknownUser(_)) => return self.say("Peer not found").await,
            Err(Error::PeerOffline(_)) => {
                return self.say(&format!("Peer {} is offline or refused connection", peer)).await
            }
            Err(e) => return self.say(&format!("Connect failed: {}", e)).await,
        };

        self.say(&format!("Connected to {}", peer)).await?;
        match session.run(&mut self.input, &mut self.out, self.events.as_mut()).await {
            Ok(ChatEnd::PeerGone) | Ok(ChatEnd::UserExit) => {}
            Ok(ChatEnd::InputClosed) => debug!("Input closed during chat with {}", peer),
            Err(Error::SessionClosed) => self.say("Session ended").await?,
            Err(e) => self.say(&format!("Chat failed: {}", e)).await?,
        }
        self.say("Connection closed").await
    }

    async fn status(&mut self) -> Result<()> {
        let friends = match self.node.status().await {
            Ok(friends) => friends,
            Err(Error::NotLoggedIn) => return self.say("Login first").await,
            Err(e) => return Err(e),
        };

        self.say("Friends status:").await?;
        if friends.is_empty() {
            return self.say("  (no friends yet)").await;
        }
        for friend in friends {
            let flag = if friend.has_unread { " *" } else { "" };
            self.say(&format!("  {}{}", friend.username, flag)).await?;
        }
        Ok(())
    }

    async fn show_chat(&mut self) -> Result<()> {
        if !self.node.session().is_logged_in().await {
            return self.say("Login first").await;
        }

        let Some(peer) = self.ask("Enter peer username to show chat: ").await? else {
            return Ok(());
        };

        let lines = match self.node.show_chat(&peer).await {
            Ok(lines) => lines,
            Err(e) => return self.say(&format!("Show chat failed: {}", e)).await,
        };

        self.say(&format!("Chat with {}", peer)).await?;
        if lines.is_empty() {
            return self.say("  (no messages)").await;
        }
        for line in lines {
            self.say(&line.display()).await?;
        }
        Ok(())
    }

    async fn end_chat(&mut self) -> Result<()> {
        if !self.node.session().is_logged_in().await {
            return self.say("Login first").await;
        }

        let Some(peer) = self.ask("Enter peer username to end chat: ").await? else {
            return Ok(());
        };

        match self.node.end_chat(&peer).await {
            Ok(()) => self.say(&format!("Chat with {} ended", peer)).await,
            Err(e) => self.say(&format!("End chat failed: {}", e)).await,
        }
    }

    async fn logout(&mut self) -> Result<()> {
        match self.node.logout().await {
            Some(_) => self.say("Logged out successfully").await,
            None => self.say("Not logged in").await,
        }
    }

    /// Prompt for a value; `None` when the input ended or the answer is blank
    async fn ask(&mut self, question: &str) -> Result<Option<String>> {
        self.prompt(question).await?;
        let answer = self.input.next_line().await?.map(|line| line.trim().to_string());
        match answer {
            Some(answer) if !answer.is_empty() => Ok(Some(answer)),
            Some(_) => {
                self.say("No value given").await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn prompt(&mut self, text: &str) -> Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }

    async fn say(&mut self, text: &str) -> Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await?;
        Ok(())
    }
}
