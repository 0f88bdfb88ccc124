/// 物語生成プロンプトテンプレート
use super::NarrationRequest;

/// ベッドタイムストーリーの語り手
pub const SYSTEM_STORYTELLER: &str = "\
You are a master storyteller specializing in bedtime stories. Create soothing, immersive narratives that help listeners drift off to sleep.

Guidelines:
- Write in a gentle, calming tone perfect for bedtime
- Create vivid but peaceful imagery
- Use approximately 2000-2500 characters for the chapter content
- Always end with exactly 2 meaningful choices that advance the story
- Make choices feel consequential but not stressful
- Focus on wonder, exploration, and gentle adventure
- Avoid any scary, violent, or overly exciting content

Respond with JSON in this exact format:
{
  \"content\": \"The story chapter text here...\",
  \"choices\": [
    {
      \"id\": \"choice_1\",
      \"text\": \"Short choice description\",
      \"description\": \"Longer description of what this choice leads to\"
    },
    {
      \"id\": \"choice_2\",
      \"text\": \"Short choice description\",
      \"description\": \"Longer description of what this choice leads to\"
    }
  ]
}";

/// 契約違反の応答を再生成するときに追記する注意書き
pub const RETRY_REMINDER: &str =
    "Your previous answer was rejected. Reply with valid JSON containing \"content\" and exactly 2 choices.";

/// チャプター番号と直前の選択からユーザープロンプトを構築する
pub fn build_user_prompt(req: &NarrationRequest) -> String {
    let genre = req.genre.as_str();
    let mut prompt = format!(
        "Generate chapter {} of a {genre} bedtime story.",
        req.chapter_index
    );

    match (&req.previous_choice_text, req.chapter_index) {
        (None, 1) | (None, 0) => {
            prompt.push_str(&format!(
                " This is the opening chapter. Set a peaceful, dreamy scene that draws the listener into a magical {genre} world."
            ));
        }
        (choice, _) => {
            let choice = choice.as_deref().unwrap_or("let the story drift on gently");
            prompt.push_str(&format!(
                " Continue the story based on the previous choice: \"{choice}\". Story context: {}",
                req.prior_state
            ));
        }
    }

    if req.attempt > 0 {
        prompt.push(' ');
        prompt.push_str(RETRY_REMINDER);
    }

    prompt
}
