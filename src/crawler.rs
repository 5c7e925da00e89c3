//! Link-preview crawler detection.
//!
//! Messaging platforms "unfurl" pasted links by fetching them once. For a
//! live tunnel that single fetch would drain the stream and release the
//! producer before a human ever opens the link, so the tunnel route refuses
//! requests whose User-Agent looks like a chat crawler.

/// User-Agent fragments of the link-preview bots we refuse on tunnel URLs.
const CHAT_USER_AGENTS: &[&str] = &[
    "slack", "google", "twitter", "facebook", "facebot", "whatsapp", "discord", "telegram",
    "skype", "linkedin", "viber",
];

pub struct ChatCrawlerDetector {
    chat_user_agents: &'static [&'static str],
}

impl ChatCrawlerDetector {
    pub fn new() -> Self {
        Self {
            chat_user_agents: CHAT_USER_AGENTS,
        }
    }

    /// Case-insensitive substring match against the closed bot set.
    pub fn is_chat_crawler(&self, user_agent: &str) -> bool {
        let user_agent = user_agent.to_lowercase();
        self.chat_user_agents
            .iter()
            .any(|fragment| user_agent.contains(fragment))
    }
}

impl Default for ChatCrawlerDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_chat_crawlers() {
        let cases = [
            (
                "slack",
                "Slackbot-LinkExpanding 1.0 (+https://api.slack.com/robots)",
                true,
            ),
            (
                "google",
                "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
                true,
            ),
            ("twitter", "Twitterbot/1.0", true),
            (
                "imessage",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_11_1) AppleWebKit/601.2.4 \
                 (KHTML, like Gecko) Version/9.0.1 Safari/601.2.4 \
                 facebookexternalhit/1.1 Facebot Twitterbot/1.0",
                true,
            ),
            (
                "normal browser request",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_11_1) AppleWebKit/601.2.4 \
                 (KHTML, like Gecko) Version/9.0.1 Safari/601.2.4",
                false,
            ),
            ("empty", "", false),
        ];

        let detector = ChatCrawlerDetector::new();
        for (name, user_agent, want) in cases {
            assert_eq!(
                detector.is_chat_crawler(user_agent),
                want,
                "case {name:?} failed"
            );
        }
    }
}
