//! ヘッドレスプレイヤー: サーバーに接続して物語をターミナルで進める。
//!
//! 操作: 1 / 2 = 選択, p = 一時停止/再開, m = BGM 切替, q = 終了

use std::sync::Arc;
use std::time::Duration;

use inquire::Select;
use tokio::sync::mpsc;

use es_core::domain::story::StoryGateway;
use es_core::domain::types::{Genre, NewStory};
use es_core::infra::api_client::ApiClient;
use es_core::infra::playback::SimulatedPlayback;
use es_core::usecase::ambience::AmbienceController;
use es_core::usecase::story_player::{
    resolver_config_from, PlayerCommand, PlayerEvent, PlayerExit, StoryPlayer,
};

const DEFAULT_SERVER_URL: &str = "http://localhost:5000";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn parse_command(line: &str) -> Option<PlayerCommand> {
    match line.trim() {
        "1" => Some(PlayerCommand::Select(0)),
        "2" => Some(PlayerCommand::Select(1)),
        "p" => Some(PlayerCommand::TogglePause),
        "m" => Some(PlayerCommand::ToggleAmbience),
        "q" => Some(PlayerCommand::Quit),
        _ => None,
    }
}

fn print_event(event: &PlayerEvent) {
    match event {
        PlayerEvent::Generating { chapter_index } => {
            println!("\n… writing chapter {chapter_index} …");
        }
        PlayerEvent::ChapterStarted { chapter } => {
            println!("\n=== Chapter {} ===\n{}\n", chapter.chapter_index, chapter.text);
        }
        PlayerEvent::ChoicesOpen { choices } => {
            println!("What happens next?");
            for (i, choice) in choices.iter().enumerate() {
                println!("  [{}] {} - {}", i + 1, choice.label, choice.description);
            }
        }
        PlayerEvent::Countdown { remaining_secs } if remaining_secs % 10 == 0 => {
            println!("  ({remaining_secs}s left)");
        }
        PlayerEvent::Listening { state } => log::debug!("listening: {state:?}"),
        PlayerEvent::Resolved { label, path, .. } => println!("→ {label} ({path:?})"),
        PlayerEvent::Error(e) => eprintln!("! {}", e.message),
        PlayerEvent::Asleep => println!("\nSweet dreams."),
        PlayerEvent::Transition(t) => {
            log::debug!("{} -> {}", t.prev_state, t.new_state.as_str());
        }
        PlayerEvent::Countdown { .. }
        | PlayerEvent::Progress { .. }
        | PlayerEvent::ChapterEnded { .. } => {}
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let base_url = std::env::var("ES_SERVER_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
    let client = Arc::new(ApiClient::new(base_url, Duration::from_secs(300))?);

    let genre = Select::new("Choose a genre:", Genre::ALL.to_vec()).prompt()?;
    let voices = client.list_voices().await?;
    let voice_names: Vec<String> = voices
        .iter()
        .map(|v| format!("{} ({})", v.name, v.description))
        .collect();
    let picked = Select::new("Choose a narrator:", voice_names.clone()).prompt()?;
    let voice_id = voices
        .iter()
        .zip(&voice_names)
        .find(|(_, name)| **name == picked)
        .map(|(v, _)| v.id.clone())
        .unwrap_or_else(|| "sarah".to_string());

    let settings = match client.settings().await {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Using default settings: {e}");
            Default::default()
        }
    };

    let story = client
        .create_story(NewStory {
            genre,
            voice_id,
            title: None,
        })
        .await?;
    println!("\n✦ {} ✦", story.title);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (commands_tx, commands) = mpsc::unbounded_channel();

    let mut player = StoryPlayer::new(
        client.clone(),
        Arc::new(SimulatedPlayback::new()),
        resolver_config_from(&settings),
        events_tx,
    );

    let tracks: Vec<String> = client
        .list_music()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|t| format!("{}{}", client.base_url(), t.url))
        .collect();
    if !tracks.is_empty() {
        let ambience =
            AmbienceController::new(Arc::new(SimulatedPlayback::new()), tracks, settings.ambience_coupled);
        ambience.set_volume(settings.ambience_volume);
        player = player.with_ambience(ambience);
    }

    #[cfg(feature = "microphone")]
    if settings.voice_choice_enabled {
        use es_core::infra::audio::MicrophoneCapture;
        use es_core::usecase::resolver::VoiceInputs;
        use es_core::usecase::story_player::GatewayTranscriber;

        match MicrophoneCapture::new() {
            Ok(capture) => {
                player = player.with_voice(VoiceInputs {
                    capture: Arc::new(capture),
                    transcriber: Arc::new(GatewayTranscriber::new(client.clone())),
                });
                println!("(voice choices enabled: say \"option one\" or \"option two\")");
            }
            Err(e) => log::warn!("Microphone unavailable, voice choices disabled: {e}"),
        }
    }

    // 標準入力の読み取りはブロックするので専用スレッドで回す
    std::thread::spawn(move || {
        for line in std::io::stdin().lines().map_while(Result::ok) {
            if let Some(cmd) = parse_command(&line) {
                let quit = matches!(cmd, PlayerCommand::Quit);
                if commands_tx.send(cmd).is_err() || quit {
                    break;
                }
            }
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let exit = player.run(story, commands).await;
    let _ = printer.await;
    match exit? {
        PlayerExit::Asleep => println!("(story saved, good night)"),
        PlayerExit::Quit => println!("Goodbye."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert!(matches!(parse_command("1"), Some(PlayerCommand::Select(0))));
        assert!(matches!(parse_command(" 2 \n"), Some(PlayerCommand::Select(1))));
        assert!(matches!(parse_command("q"), Some(PlayerCommand::Quit)));
        assert!(parse_command("hello").is_none());
    }
}
