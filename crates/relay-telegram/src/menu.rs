//! Relay Telegram Menus
//!
//! Inline keyboards, callback routing and the command list registered with `setMyCommands`.

use relay_config::ModelEntry;
use relay_ipc::{InlineButton, InlineKeyboard};

pub const MODEL_CALLBACK_PREFIX: &str = "model:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuAction {
    Home,
    ModelMenu,
    SelectModel(String),
    SpeedtestStart,
    SpeedtestProbe,
    Unknown,
}

pub fn parse_callback(data: &str) -> MenuAction {
    let (scope, rest) = data.split_once(':').unwrap_or((data, ""));
    match (scope, rest) {
        ("menu", "home") => MenuAction::Home,
        ("menu", "model") => MenuAction::ModelMenu,
        ("model", id) if !id.trim().is_empty() => MenuAction::SelectModel(id.trim().to_string()),
        ("speedtest", "start") => MenuAction::SpeedtestStart,
        ("speedtest", "probe") => MenuAction::SpeedtestProbe,
        _ => MenuAction::Unknown,
    }
}

/// Commands shown in the client's command picker.
pub fn command_list() -> Vec<(&'static str, &'static str)> {
    vec![
        ("start", "Главное меню"),
        ("help", "Помощь"),
        ("model", "Выбрать модель"),
        ("who", "Кто из чата...?"),
        ("pair", "Кто кого...?"),
        ("nick", "Показать или задать прозвище"),
        ("history", "Показать историю диалога"),
        ("reset", "Сбросить диалог"),
        ("speedtest", "Тест скорости"),
    ]
}

pub fn help_text(mention: &str, model_label: &str) -> String {
    format!(
        "📚 *Помощь*\n\n\
         В личке просто пишите вопрос. В группе начните сообщение с {} или ответьте на моё сообщение.\n\n\
         /model - Выбрать модель (сейчас: {})\n\
         /who <вопрос> - Кто из чата...?\n\
         /pair <вопрос> - Кто кого...?\n\
         /nick [прозвище] - Показать или задать прозвище\n\
         /history - История диалога\n\
         /reset - Сбросить диалог\n\
         /speedtest - Тест скорости",
        mention, model_label
    )
}

pub fn home_menu(mention: &str, model_label: &str) -> (String, InlineKeyboard) {
    let text = format!(
        "🏠 *Привет!*\n\nЯ отвечаю на вопросы с помощью языковой модели.\nТекущая модель: {}\n\nВ группе обращайтесь ко мне через {}.",
        model_label, mention
    );
    let keyboard = vec![
        vec![InlineButton::new("🤖 Выбрать модель", "menu:model")],
        vec![InlineButton::new("📶 Тест скорости", "speedtest:start")],
    ];
    (text, keyboard)
}

pub fn model_menu(entries: &[ModelEntry], current: &str) -> (String, InlineKeyboard) {
    let mut keyboard: InlineKeyboard = entries
        .iter()
        .map(|entry| {
            let label = if entry.id == current {
                format!("✅ {}", entry.label)
            } else {
                entry.label.clone()
            };
            vec![InlineButton::new(
                label,
                format!("{}{}", MODEL_CALLBACK_PREFIX, entry.id),
            )]
        })
        .collect();
    keyboard.push(vec![nav_back()]);
    ("🤖 *Выберите модель:*".to_string(), keyboard)
}

pub fn speedtest_menu(probe_available: bool) -> InlineKeyboard {
    let mut row = vec![InlineButton::new("🔁 Измерить снова", "speedtest:start")];
    if probe_available {
        row.push(InlineButton::new("🌐 Скорость сервера", "speedtest:probe"));
    }
    vec![row]
}

pub fn nav_back() -> InlineButton {
    InlineButton::new("⬅️ Назад", "menu:home")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_callback_routes_known_actions() {
        assert_eq!(parse_callback("menu:home"), MenuAction::Home);
        assert_eq!(parse_callback("menu:model"), MenuAction::ModelMenu);
        assert_eq!(
            parse_callback("model:gpt-4o"),
            MenuAction::SelectModel("gpt-4o".to_string())
        );
        assert_eq!(parse_callback("speedtest:probe"), MenuAction::SpeedtestProbe);
        assert_eq!(parse_callback("model:"), MenuAction::Unknown);
        assert_eq!(parse_callback("garbage"), MenuAction::Unknown);
    }

    #[test]
    fn model_menu_marks_current_selection() {
        let entries = vec![
            ModelEntry::new("a", "Model A"),
            ModelEntry::new("b", "Model B"),
        ];
        let (_, keyboard) = model_menu(&entries, "b");
        assert_eq!(keyboard.len(), 3);
        assert_eq!(keyboard[0][0].text, "Model A");
        assert_eq!(keyboard[1][0].text, "✅ Model B");
        assert_eq!(keyboard[1][0].callback_data, "model:b");
    }

    #[test]
    fn speedtest_menu_offers_probe_only_when_configured() {
        assert_eq!(speedtest_menu(false)[0].len(), 1);
        assert_eq!(speedtest_menu(true)[0][1].callback_data, "speedtest:probe");
    }

    #[test]
    fn home_menu_mentions_bot_handle() {
        let (text, keyboard) = home_menu("@RelayBot", "GPT-4o mini");
        assert!(text.contains("@RelayBot"));
        assert_eq!(keyboard.len(), 2);
    }
}
