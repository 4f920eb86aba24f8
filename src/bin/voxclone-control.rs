//! voxclone-control - CLI control utility for the voxclone daemon
//!
//! Talks to the daemon over the session D-Bus.

use clap::{Parser, Subcommand};
use zbus::blocking::Connection;

const DEST: &str = "org.voxclone.Service";
const PATH: &str = "/org/voxclone/Service";
const IFACE: &str = "org.voxclone.Service";

/// CLI control utility for the voxclone daemon
#[derive(Parser)]
#[command(name = "voxclone-control")]
#[command(version)]
#[command(about = "Control utility for the voxclone voice profile daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check service health
    Ping,

    /// Show daemon status
    Status,

    /// List voice profiles
    Profiles,

    /// Show one profile (id or name) as JSON
    Show { profile: String },

    /// Create a profile from zero or more audio files
    Create {
        name: String,
        /// WAV or MP3 reference recordings
        samples: Vec<String>,
    },

    /// Rename a profile
    Rename { profile_id: String, name: String },

    /// Set the assistant prompt (omit to clear)
    Prompt {
        profile_id: String,
        prompt: Option<String>,
    },

    /// Delete a profile and all of its samples
    Delete { profile_id: String },

    /// Sample management
    Sample {
        #[command(subcommand)]
        action: SampleAction,
    },

    /// Generate speech in a profile's voice and save it
    Generate {
        /// Profile id or name
        profile: String,
        text: String,
        #[arg(short, long, default_value = "")]
        language: String,
        /// Output WAV path (a temp file when omitted)
        #[arg(short, long, default_value = "")]
        output: String,
    },

    /// Generate speech and play it on the daemon's machine
    Speak {
        /// Profile id or name
        profile: String,
        text: String,
        #[arg(short, long, default_value = "")]
        language: String,
        /// Volume level (0.0-1.0)
        #[arg(short, long, default_value = "1.0")]
        volume: f64,
        /// Output device name (substring match)
        #[arg(short, long, default_value = "")]
        device: String,
    },

    /// List audio output devices
    Devices,

    /// Synthesis engine management
    Engine {
        #[command(subcommand)]
        action: Option<EngineAction>,
    },

    /// Show the voice-loop session state
    Session,

    /// Push-to-talk: start capturing
    Listen,

    /// Push-to-talk: stop capturing
    Release,
}

#[derive(Subcommand)]
enum SampleAction {
    /// List a profile's samples
    List { profile: String },
    /// Add an audio file to a profile
    Add { profile_id: String, path: String },
    /// Record a sample from the daemon's microphone
    Record {
        profile_id: String,
        /// Recording length in seconds
        #[arg(short, long, default_value_t = 10.0)]
        seconds: f64,
    },
    /// Remove a sample by filename
    Remove { profile_id: String, filename: String },
}

#[derive(Subcommand)]
enum EngineAction {
    /// Load the model now
    Warm,
    /// Clear a failed load and try again
    Reload,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let conn = Connection::session()?;

    match cli.command {
        Commands::Ping => {
            let result: String = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "Ping", &())?
                .body()
                .deserialize()?;
            println!("{}", result);
        }

        Commands::Status => {
            let version: String = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "GetVersion", &())?
                .body()
                .deserialize()?;
            let (status, detail, backend): (String, String, String) = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "EngineStatus", &())?
                .body()
                .deserialize()?;
            let queued: u32 = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "QueueDepth", &())?
                .body()
                .deserialize()?;
            let (state, error, cycles): (String, String, u64) = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "GetSessionState", &())?
                .body()
                .deserialize()?;

            println!("voxclone Status");
            println!("───────────────");
            println!("Version:   {}", version);
            println!("Backend:   {}", backend);
            if detail.is_empty() {
                println!("Engine:    {}", status);
            } else {
                println!("Engine:    {} ({})", status, detail);
            }
            println!("Queued:    {}", queued);
            println!("Session:   {} after {} cycles", state, cycles);
            if !error.is_empty() {
                println!("Error:     {}", error);
            }
        }

        Commands::Profiles => {
            let profiles: Vec<(String, String, u32, String)> = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "ListProfiles", &())?
                .body()
                .deserialize()?;

            if profiles.is_empty() {
                println!("No profiles");
            } else {
                println!("Voice Profiles");
                println!("──────────────");
                for (id, name, count, created) in profiles {
                    println!("  {} ({}) - {} samples, created {}", name, id, count, created);
                }
            }
        }

        Commands::Show { profile } => {
            let json: String = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "GetProfile", &profile)?
                .body()
                .deserialize()?;
            println!("{}", json);
        }

        Commands::Create { name, samples } => {
            let paths: Vec<String> = samples
                .iter()
                .map(|p| {
                    std::fs::canonicalize(p)
                        .map(|c| c.to_string_lossy().into_owned())
                        .unwrap_or_else(|_| p.clone())
                })
                .collect();
            let id: String = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "CreateProfile", &(name.clone(), paths))?
                .body()
                .deserialize()?;
            println!("✓ Created '{}' ({})", name, id);
        }

        Commands::Rename { profile_id, name } => {
            let _: () = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "RenameProfile", &(profile_id, name.clone()))?
                .body()
                .deserialize()?;
            println!("✓ Renamed to '{}'", name);
        }

        Commands::Prompt { profile_id, prompt } => {
            let cleared = prompt.is_none();
            let _: () = conn
                .call_method(
                    Some(DEST),
                    PATH,
                    Some(IFACE),
                    "SetPrompt",
                    &(profile_id, prompt.unwrap_or_default()),
                )?
                .body()
                .deserialize()?;
            println!("{}", if cleared { "✓ Prompt cleared" } else { "✓ Prompt set" });
        }

        Commands::Delete { profile_id } => {
            let _: () = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "DeleteProfile", &profile_id)?
                .body()
                .deserialize()?;
            println!("✓ Deleted {}", profile_id);
        }

        Commands::Sample { action } => match action {
            SampleAction::List { profile } => {
                let samples: Vec<(String, f64, u32, u32)> = conn
                    .call_method(Some(DEST), PATH, Some(IFACE), "ListSamples", &profile)?
                    .body()
                    .deserialize()?;
                if samples.is_empty() {
                    println!("No samples");
                }
                for (filename, secs, rate, channels) in samples {
                    println!("  {} - {:.1}s, {} Hz, {} ch", filename, secs, rate, channels);
                }
            }
            SampleAction::Add { profile_id, path } => {
                let path = std::fs::canonicalize(&path)?.to_string_lossy().into_owned();
                let filename: String = conn
                    .call_method(Some(DEST), PATH, Some(IFACE), "AddSample", &(profile_id, path))?
                    .body()
                    .deserialize()?;
                println!("✓ Added {}", filename);
            }
            SampleAction::Record { profile_id, seconds } => {
                println!("Recording {:.1}s...", seconds);
                let filename: String = conn
                    .call_method(Some(DEST), PATH, Some(IFACE), "RecordSample", &(profile_id, seconds))?
                    .body()
                    .deserialize()?;
                println!("✓ Recorded {}", filename);
            }
            SampleAction::Remove {
                profile_id,
                filename,
            } => {
                let _: () = conn
                    .call_method(
                        Some(DEST),
                        PATH,
                        Some(IFACE),
                        "RemoveSample",
                        &(profile_id, filename.clone()),
                    )?
                    .body()
                    .deserialize()?;
                println!("✓ Removed {}", filename);
            }
        },

        Commands::Generate {
            profile,
            text,
            language,
            output,
        } => {
            let output = if output.is_empty() {
                output
            } else {
                let p = std::path::Path::new(&output);
                if p.is_absolute() {
                    output
                } else {
                    std::env::current_dir()?.join(p).to_string_lossy().into_owned()
                }
            };
            println!("Generating...");
            let path: String = conn
                .call_method(
                    Some(DEST),
                    PATH,
                    Some(IFACE),
                    "Generate",
                    &(profile, text, language, output),
                )?
                .body()
                .deserialize()?;
            println!("✓ Saved {}", path);
        }

        Commands::Speak {
            profile,
            text,
            language,
            volume,
            device,
        } => {
            let _: () = conn
                .call_method(
                    Some(DEST),
                    PATH,
                    Some(IFACE),
                    "Speak",
                    &(profile, text.clone(), language, volume, device),
                )?
                .body()
                .deserialize()?;
            println!("Spoke: {}", text);
        }

        Commands::Devices => {
            let devices: Vec<String> = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "ListOutputDevices", &())?
                .body()
                .deserialize()?;
            println!("Audio Output Devices");
            println!("────────────────────");
            for name in devices {
                println!("  {}", name);
            }
        }

        Commands::Engine { action } => {
            let (method, verb) = match action {
                Some(EngineAction::Warm) => ("WarmEngine", "Warmed"),
                Some(EngineAction::Reload) => ("ReloadEngine", "Reloaded"),
                None => {
                    let (status, detail, backend): (String, String, String) = conn
                        .call_method(Some(DEST), PATH, Some(IFACE), "EngineStatus", &())?
                        .body()
                        .deserialize()?;
                    println!("{} engine: {} {}", backend, status, detail);
                    return Ok(());
                }
            };
            let status: String = conn
                .call_method(Some(DEST), PATH, Some(IFACE), method, &())?
                .body()
                .deserialize()?;
            println!("✓ {}: {}", verb, status);
        }

        Commands::Session => {
            let (state, error, cycles): (String, String, u64) = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "GetSessionState", &())?
                .body()
                .deserialize()?;
            if error.is_empty() {
                println!("{} ({} cycles)", state, cycles);
            } else {
                println!("{} ({} cycles): {}", state, cycles, error);
            }
        }

        Commands::Listen => {
            let ok: bool = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "StartListening", &())?
                .body()
                .deserialize()?;
            println!("{}", if ok { "Listening..." } else { "Push-to-talk is not active" });
        }

        Commands::Release => {
            let ok: bool = conn
                .call_method(Some(DEST), PATH, Some(IFACE), "StopListening", &())?
                .body()
                .deserialize()?;
            println!("{}", if ok { "Stopped listening" } else { "Push-to-talk is not active" });
        }
    }

    Ok(())
}
