//! Relay Core
//!
//! Runtime orchestration: consumes inbound envelopes, keeps the per-user and
//! per-chat state, and drives the conversation, selector and speed-test flows.

pub mod addressing;
pub mod catalog;
pub mod commands;
pub mod error;
pub mod keyed;
pub mod nicknames;
pub mod placeholder;
pub mod roster;
pub mod selector;
pub mod sessions;
pub mod throughput;

#[cfg(test)]
mod testing;

use addressing::Addressing;
use anyhow::Result;
use catalog::ModelCatalog;
use commands::{parse_command, Command};
use error::{RelayError, GENERIC_FAILURE_MESSAGE};
use keyed::KeyedState;
use nicknames::NicknameRegistry;
use placeholder::PlaceholderManager;
use relay_config::{CompletionConfig, Config, ProviderType, SelectorSource};
use relay_ipc::{
    BotIdentity, CallbackEvent, ChatKind, Envelope, FileMeta, Inbound, InboundMessage,
    InlineKeyboard, Messenger, UserProfile,
};
use relay_providers::{CompletionService, GeminiCompletion, OpenAICompatibleCompletion};
use relay_telegram::menu::{self, MenuAction};
use roster::MembershipRoster;
use sessions::SessionStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use throughput::{HttpProbe, SpeedtestSessions, TransferMeasurement};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

const MAX_INBOUND_CONCURRENCY: usize = 8;
const HISTORY_ANSWER_PREVIEW_CHARS: usize = 300;
const SPEEDTEST_FILE_NAME: &str = "speedtest.bin";
const PROBE_TIMEOUT: Duration = Duration::from_secs(120);

const SPEEDTEST_STARTING: &str =
    "Запускаю тест скорости... Это может занять около 30 секунд. 📏";
const SPEEDTEST_FAILED: &str =
    "Произошла ошибка при выполнении теста скорости. Попробуй снова позже. 😔";
const SPEEDTEST_FOOTER: &str =
    "Эти результаты показывают скорость связи между тобой и ботом. Реальная скорость может отличаться.";

pub fn build_completion_service(config: &CompletionConfig) -> Result<Arc<dyn CompletionService>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let service: Arc<dyn CompletionService> = match config.provider_type {
        ProviderType::OpenAi => Arc::new(OpenAICompatibleCompletion::new(
            config.api_key.clone(),
            config.base_url.clone(),
            timeout,
            config.system_prompt.clone(),
        )?),
        ProviderType::Gemini => Arc::new(GeminiCompletion::new(
            config.api_key.clone(),
            config.base_url.clone(),
            timeout,
            config.system_prompt.clone(),
        )?),
    };
    Ok(service)
}

pub struct RelayRuntime {
    messenger: Arc<dyn Messenger>,
    completion: Arc<dyn CompletionService>,
    identity: BotIdentity,
    mention: String,
    catalog: Arc<ModelCatalog>,
    sessions: SessionStore,
    roster: MembershipRoster,
    nicknames: NicknameRegistry,
    placeholders: PlaceholderManager,
    speedtests: SpeedtestSessions,
    selector_source: SelectorSource,
    speedtest_payload_bytes: u64,
    probe: Option<HttpProbe>,
    user_locks: KeyedState<i64, ()>,
    inbound_slots: Arc<Semaphore>,
}

impl RelayRuntime {
    pub fn new(
        config: &Config,
        messenger: Arc<dyn Messenger>,
        completion: Arc<dyn CompletionService>,
        identity: BotIdentity,
    ) -> Result<Self> {
        let catalog = Arc::new(ModelCatalog::from_config(&config.completion)?);
        // A configured handle wins over the one reported by getMe.
        let identity = match config.telegram.bot_username() {
            Some(username) => BotIdentity {
                username,
                ..identity
            },
            None => identity,
        };
        let probe = match config.speedtest.probe_url() {
            Some(url) => Some(HttpProbe::new(url, PROBE_TIMEOUT)?),
            None => None,
        };

        Ok(Self {
            placeholders: PlaceholderManager::new(Arc::clone(&messenger), &config.placeholder.text),
            messenger,
            completion,
            mention: identity.mention_token(),
            identity,
            sessions: SessionStore::new(Arc::clone(&catalog)),
            catalog,
            roster: MembershipRoster::new(),
            nicknames: NicknameRegistry::new(),
            speedtests: SpeedtestSessions::new(),
            selector_source: config.selector.source,
            speedtest_payload_bytes: config.speedtest.payload_bytes,
            probe,
            user_locks: KeyedState::new(),
            inbound_slots: Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY)),
        })
    }

    /// Processes envelopes until the bus closes, each in its own task.
    pub async fn run(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<Envelope>) {
        info!(
            completion = self.completion.name(),
            mention = %self.mention,
            "Relay runtime started"
        );

        while let Some(envelope) = inbound_rx.recv().await {
            let runtime = Arc::clone(&self);
            tokio::spawn(runtime.process_envelope(envelope));
        }

        info!("Event bus closed, stopping message processor");
    }

    /// Outermost boundary: errors and panics are logged and answered generically.
    ///
    /// The sender's scope lock is taken before a worker permit, so updates queued
    /// behind one busy user never hold permits other users need.
    pub async fn process_envelope(self: Arc<Self>, envelope: Envelope) {
        let trace_id = envelope.trace_id.clone();
        let chat_id = envelope.chat_id();

        let _scope_guard = match envelope.sender_id() {
            Some(user_id) => Some(self.user_locks.slot(&user_id).await.lock_owned().await),
            None => None,
        };
        let _permit = match Arc::clone(&self.inbound_slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                error!(
                    "Inbound worker semaphore closed (trace_id={}): {}",
                    trace_id, err
                );
                return;
            }
        };

        let worker = Arc::clone(&self);
        let outcome = tokio::spawn(async move { worker.handle_envelope(envelope).await }).await;
        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!(
                    "Error processing inbound update (trace_id={}): {:#}",
                    trace_id, e
                );
                true
            }
            Err(e) => {
                error!("Inbound handler aborted (trace_id={}): {}", trace_id, e);
                true
            }
        };

        if let (true, Some(chat_id)) = (failed, chat_id) {
            if let Err(e) = self
                .messenger
                .send_text(chat_id, GENERIC_FAILURE_MESSAGE, None, None)
                .await
            {
                warn!("Failed to send failure notice (trace_id={}): {}", trace_id, e);
            }
        }
    }

    /// Dispatches one update. Callers serialize per sender, see `process_envelope`.
    async fn handle_envelope(&self, envelope: Envelope) -> Result<()> {
        debug!(
            trace_id = %envelope.trace_id,
            account_tag = %envelope.account_tag,
            "Handling inbound update"
        );

        match envelope.inbound {
            Inbound::Message(message) => self.handle_message(message).await,
            Inbound::Callback(callback) => self.handle_callback(callback).await,
        }
    }

    async fn handle_message(&self, message: InboundMessage) -> Result<()> {
        let Some(sender) = message.sender.clone() else {
            debug!(chat_id = message.chat_id, "Skipping message without sender");
            return Ok(());
        };
        if sender.is_bot {
            return Ok(());
        }

        self.roster
            .observe(message.chat_id, message.chat_kind, &sender)
            .await;

        if message.text.is_none() && message.document.is_none() {
            return Ok(());
        }
        let text = message.text.clone().unwrap_or_default();

        if let Some(command) = parse_command(&text, &self.identity.username) {
            return self.handle_command(&message, &sender, command).await;
        }

        if let Some(document) = &message.document {
            if message.chat_kind == ChatKind::Private || self.speedtests.is_active(sender.id).await
            {
                return self.handle_document(&message, &sender, document).await;
            }
        }

        let replied_to_assistant = message
            .reply_to
            .as_ref()
            .and_then(|reply| reply.author.as_ref())
            .is_some_and(|author| author.id == self.identity.id);

        match addressing::resolve(message.chat_kind, &text, replied_to_assistant, &self.mention) {
            Addressing::NotAddressed => Ok(()),
            Addressing::Empty => self.reply_error(&message, &RelayError::EmptyInput).await,
            Addressing::Addressed(prompt) => self.converse(&message, sender.id, prompt).await,
        }
    }

    /// Placeholder, completion, placeholder removal, then the answer.
    async fn converse(&self, message: &InboundMessage, user_id: i64, prompt: String) -> Result<()> {
        let chat_id = message.chat_id;
        let model = self.sessions.get_model(user_id).await;
        let prior = self.sessions.history(user_id).await;

        let placeholder = match self.placeholders.begin(chat_id, Some(message.message_id)).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(chat_id, "Failed to post placeholder: {}", e);
                None
            }
        };

        let started = Instant::now();
        let outcome = self.completion.complete(&prompt, &model, &prior).await;

        if let Some(handle) = placeholder {
            handle.resolve().await;
        }

        match outcome {
            Ok(answer) => {
                info!(
                    chat_id,
                    user_id,
                    model = %model,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Completion delivered"
                );
                self.sessions
                    .append_turn(user_id, prompt, answer.clone())
                    .await;
                self.messenger
                    .send_text(chat_id, &answer, Some(message.message_id), None)
                    .await?;
                Ok(())
            }
            Err(err) => {
                warn!(
                    chat_id,
                    user_id,
                    model = %model,
                    kind = err.kind(),
                    "Completion failed: {}",
                    err
                );
                self.reply_error(message, &RelayError::from(err)).await
            }
        }
    }

    async fn handle_command(
        &self,
        message: &InboundMessage,
        sender: &UserProfile,
        command: Command,
    ) -> Result<()> {
        let chat_id = message.chat_id;
        match command {
            Command::Start => {
                let model = self.sessions.get_model(sender.id).await;
                let (text, keyboard) = menu::home_menu(&self.mention, self.catalog.label(&model));
                self.send(chat_id, &text, Some(keyboard)).await
            }
            Command::Help => {
                let model = self.sessions.get_model(sender.id).await;
                let text = menu::help_text(&self.mention, self.catalog.label(&model));
                self.send(chat_id, &text, None).await
            }
            Command::Model(args) if args.is_empty() => {
                let model = self.sessions.get_model(sender.id).await;
                let (text, keyboard) = menu::model_menu(self.catalog.entries(), &model);
                self.send(chat_id, &text, Some(keyboard)).await
            }
            Command::Model(args) => match self.sessions.set_model(sender.id, &args).await {
                Ok(()) => {
                    let text = format!("✅ Модель переключена: {}", self.catalog.label(args.trim()));
                    self.reply(message, &text).await
                }
                Err(err) => self.reply_error(message, &err).await,
            },
            Command::Who(question) => self.select(message, &question, false).await,
            Command::Pair(question) => self.select(message, &question, true).await,
            Command::Nick(alias) => self.nick(message, sender, &alias).await,
            Command::History => self.show_history(message, sender.id).await,
            Command::Reset => {
                self.sessions.clear(sender.id).await;
                self.reply(message, "🔄 *Сброс сессии*\n\nИстория очищена, модель по умолчанию. Начинаем заново!")
                    .await
            }
            Command::Speedtest => self.start_speedtest(chat_id, sender.id).await,
            Command::Unknown(name) => {
                if message.chat_kind == ChatKind::Private {
                    let text = format!("Неизвестная команда /{}. Список команд: /help", name);
                    self.reply(message, &text).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn eligible_members(&self, chat_id: i64) -> Result<Vec<UserProfile>> {
        match self.selector_source {
            SelectorSource::Roster => Ok(self.roster.members(chat_id).await),
            SelectorSource::Administrators => self.messenger.chat_administrators(chat_id).await,
        }
    }

    async fn select(&self, message: &InboundMessage, question: &str, pair: bool) -> Result<()> {
        let chat_id = message.chat_id;
        let members = if message.chat_kind.is_group_kind() {
            self.eligible_members(chat_id).await?
        } else {
            Vec::new()
        };
        let aliases = self.nicknames.snapshot(chat_id).await;

        let outcome = {
            let mut rng = rand::thread_rng();
            if pair {
                selector::select_pair(&mut rng, message.chat_kind, question, &members, &aliases)
            } else {
                selector::select_single(&mut rng, message.chat_kind, question, &members, &aliases)
            }
        };

        match outcome {
            Ok(line) => self.reply(message, &line).await,
            Err(err) => {
                if matches!(
                    err,
                    RelayError::NoEligibleMembers | RelayError::InsufficientMembers
                ) {
                    match self.messenger.chat_member_count(chat_id).await {
                        Ok(total) => info!(
                            chat_id,
                            known = members.len(),
                            total,
                            source = ?self.selector_source,
                            "Not enough eligible members for selection"
                        ),
                        Err(e) => debug!(chat_id, "Failed to fetch member count: {}", e),
                    }
                }
                self.reply_error(message, &err).await
            }
        }
    }

    async fn nick(&self, message: &InboundMessage, sender: &UserProfile, alias: &str) -> Result<()> {
        let chat_id = message.chat_id;
        let text = match self.nicknames.set(chat_id, sender.id, alias).await {
            Ok(alias) => format!("✅ Теперь вы — {}", alias),
            Err(RelayError::EmptyInput) => match self.nicknames.get(chat_id, sender.id).await {
                Some(current) => format!("🏷 Ваше прозвище: {}", current),
                None => "🏷 Прозвище не задано. Задать: /nick <прозвище>".to_string(),
            },
            Err(err) => return self.reply_error(message, &err).await,
        };
        self.reply(message, &text).await
    }

    async fn show_history(&self, message: &InboundMessage, user_id: i64) -> Result<()> {
        let history = self.sessions.history(user_id).await;
        if history.is_empty() {
            return self.reply(message, "📭 История пуста.").await;
        }

        let model = self.sessions.get_model(user_id).await;
        let mut text = format!(
            "🗂 История (модель: {}):\n",
            self.catalog.label(&model)
        );
        for (idx, turn) in history.iter().enumerate() {
            text.push_str(&format!(
                "\n{}. ❓ {}\n💬 {}\n",
                idx + 1,
                turn.question,
                preview(&turn.answer, HISTORY_ANSWER_PREVIEW_CHARS)
            ));
        }
        self.reply(message, &text).await
    }

    /// Ping and download phase. The upload phase finishes on the user's next document.
    async fn start_speedtest(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.send(chat_id, SPEEDTEST_STARTING, None).await?;

        let started = Instant::now();
        self.messenger
            .send_chat_action(chat_id, "upload_document")
            .await?;
        let ping_ms = throughput::millis(started.elapsed());

        let payload_bytes = self.speedtest_payload_bytes;
        let payload = vec![0u8; payload_bytes as usize];
        let started_at = Instant::now();
        self.messenger
            .send_document(chat_id, SPEEDTEST_FILE_NAME, payload)
            .await?;
        let download_mbps = throughput::rate_mbps(payload_bytes, started_at.elapsed());

        self.speedtests
            .start(
                user_id,
                TransferMeasurement {
                    started_at,
                    payload_bytes,
                    ping_ms,
                    download_mbps,
                },
            )
            .await;

        let text = format!(
            "Пинг: {:.2} мс\nВходящая скорость: {:.2} Мбит/с\n\n\
             Теперь отправь мне любой файл документом, чтобы измерить исходящую скорость.",
            ping_ms, download_mbps
        );
        self.send(chat_id, &text, None).await
    }

    async fn handle_document(
        &self,
        message: &InboundMessage,
        sender: &UserProfile,
        document: &FileMeta,
    ) -> Result<()> {
        if !self.speedtests.is_active(sender.id).await {
            return self
                .reply_error(message, &RelayError::SpeedtestNotStarted)
                .await;
        }

        let started = Instant::now();
        let bytes = self.messenger.download_file(&document.file_id).await?;
        let elapsed = started.elapsed();
        let size = document.file_size.unwrap_or(bytes.len() as u64);

        match self.speedtests.finish(sender.id, size, elapsed).await {
            Ok(report) => {
                let text = format!(
                    "{}\n\n{}",
                    report.render("Результаты теста скорости:"),
                    SPEEDTEST_FOOTER
                );
                let keyboard = menu::speedtest_menu(self.probe.is_some());
                self.send(message.chat_id, &text, Some(keyboard)).await
            }
            Err(err) => self.reply_error(message, &err).await,
        }
    }

    async fn run_probe(&self, chat_id: i64) -> Result<()> {
        let Some(probe) = &self.probe else {
            return self
                .send(chat_id, "🌐 Сервер для замера не настроен.", None)
                .await;
        };

        self.send(chat_id, SPEEDTEST_STARTING, None).await?;
        let text = match probe.run(self.speedtest_payload_bytes).await {
            Ok(report) => report.render("Скорость сервера, где я запущен:"),
            Err(e) => {
                warn!(probe = probe.base_url(), "HTTP speed probe failed: {}", e);
                SPEEDTEST_FAILED.to_string()
            }
        };
        self.send(chat_id, &text, Some(menu::speedtest_menu(true)))
            .await
    }

    async fn handle_callback(&self, callback: CallbackEvent) -> Result<()> {
        let user_id = callback.from.id;
        let action = menu::parse_callback(&callback.data);
        debug!(user_id, ?action, "Handling callback");

        let Some(chat_id) = callback.chat_id else {
            return self.messenger.answer_callback(&callback.query_id, None).await;
        };

        match action {
            MenuAction::Home => {
                self.messenger.answer_callback(&callback.query_id, None).await?;
                let model = self.sessions.get_model(user_id).await;
                let (text, keyboard) = menu::home_menu(&self.mention, self.catalog.label(&model));
                self.show(chat_id, callback.message_id, &text, keyboard).await
            }
            MenuAction::ModelMenu => {
                self.messenger.answer_callback(&callback.query_id, None).await?;
                let model = self.sessions.get_model(user_id).await;
                let (text, keyboard) = menu::model_menu(self.catalog.entries(), &model);
                self.show(chat_id, callback.message_id, &text, keyboard).await
            }
            MenuAction::SelectModel(id) => match self.sessions.set_model(user_id, &id).await {
                Ok(()) => {
                    let notice = format!("✅ {}", self.catalog.label(&id));
                    self.messenger
                        .answer_callback(&callback.query_id, Some(&notice))
                        .await?;
                    let (text, keyboard) = menu::model_menu(self.catalog.entries(), &id);
                    self.show(chat_id, callback.message_id, &text, keyboard).await
                }
                Err(err) => {
                    self.messenger
                        .answer_callback(&callback.query_id, Some(err.user_message()))
                        .await
                }
            },
            MenuAction::SpeedtestStart => {
                self.messenger.answer_callback(&callback.query_id, None).await?;
                self.start_speedtest(chat_id, user_id).await
            }
            MenuAction::SpeedtestProbe => {
                self.messenger.answer_callback(&callback.query_id, None).await?;
                self.run_probe(chat_id).await
            }
            MenuAction::Unknown => {
                self.messenger.answer_callback(&callback.query_id, None).await
            }
        }
    }

    /// Edits the keyboard message in place when there is one, otherwise sends anew.
    async fn show(
        &self,
        chat_id: i64,
        message_id: Option<i64>,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<()> {
        match message_id {
            Some(message_id) => {
                self.messenger
                    .edit_text(chat_id, message_id, text, Some(keyboard))
                    .await
            }
            None => self.send(chat_id, text, Some(keyboard)).await,
        }
    }

    async fn send(&self, chat_id: i64, text: &str, keyboard: Option<InlineKeyboard>) -> Result<()> {
        self.messenger
            .send_text(chat_id, text, None, keyboard)
            .await
            .map(|_| ())
    }

    async fn reply(&self, message: &InboundMessage, text: &str) -> Result<()> {
        self.messenger
            .send_text(message.chat_id, text, Some(message.message_id), None)
            .await
            .map(|_| ())
    }

    async fn reply_error(&self, message: &InboundMessage, err: &RelayError) -> Result<()> {
        debug!(chat_id = message.chat_id, "Rejected request: {}", err);
        self.reply(message, err.user_message()).await
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}
