use eframe::egui;
use poll_promise::Promise;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use llm_workbench::config::{AppConfig, ImageConfig};
use llm_workbench::endpoint_type::EndpointType;
use llm_workbench::export;
use llm_workbench::imageclient::ImageClient;
use llm_workbench::llmclient::LLMClient;
use llm_workbench::request::ImageAttachment;
use llm_workbench::store::{Conversation, RecordStore, SqliteStore, StoredImage};
use llm_workbench::{Chunk, Dispatcher, RemoteError, ResultContainer, Role, TaskId, Turn, UiAdapter};

// Rows shown when a conversation is opened
const HISTORY_ROWS: usize = 500;
const GALLERY_SIZE: usize = 24;

fn decode_texture(ctx: &egui::Context, name: String, bytes: &[u8]) -> Result<egui::TextureHandle, image::ImageError> {
    let rgba = image::load_from_memory(bytes)?.to_rgba8();
    let size = [rgba.width() as usize, rgba.height() as usize];
    let color_image = egui::ColorImage::from_rgba_unmultiplied(size, rgba.as_raw());
    Ok(ctx.load_texture(name, color_image, egui::TextureOptions::default()))
}

/// Chat surface state, driven by lifecycle events.
pub struct ChatView {
    store: Option<Rc<SqliteStore>>,
    pub conversations: Vec<Conversation>,
    pub chat_history: Vec<(String, String)>,
    pub current_response: String,
    pub responding: bool,
    pub error_message: Option<String>,
}

impl ChatView {
    fn new(store: Option<Rc<SqliteStore>>) -> Self {
        let mut view = Self {
            store,
            conversations: Vec::new(),
            chat_history: Vec::new(),
            current_response: String::new(),
            responding: false,
            error_message: None,
        };
        if let Some(store) = &view.store {
            if let Err(e) = store.open_latest_conversation() {
                tracing::warn!("Could not open last conversation: {}", e);
            }
        }
        view.reload();
        view
    }

    pub fn current_conversation(&self) -> Option<i64> {
        self.store.as_ref().and_then(|store| store.current_conversation())
    }

    /// Re-read the conversation list and the current conversation's rows.
    fn reload(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.conversations() {
            Ok(conversations) => self.conversations = conversations,
            Err(e) => tracing::warn!("Could not list conversations: {}", e),
        }
        match store.recent_messages(HISTORY_ROWS) {
            Ok(messages) => {
                self.chat_history = messages
                    .into_iter()
                    .map(|m| (m.role.as_str().to_string(), m.content))
                    .collect();
            }
            Err(e) => tracing::warn!("Could not load chat history: {}", e),
        }
    }

    fn reset(&mut self) {
        self.chat_history.clear();
        self.current_response.clear();
        self.responding = false;
        self.error_message = None;
    }

    pub fn new_conversation(&mut self) {
        self.reset();
        if let Some(store) = &self.store {
            if let Err(e) = store.new_conversation() {
                tracing::error!("Failed to create conversation: {}", e);
                self.error_message = Some(e.to_string());
            }
        }
        self.reload();
    }

    pub fn open_conversation(&mut self, id: i64) {
        let Some(store) = &self.store else {
            return;
        };
        store.select_conversation(id);
        self.reset();
        self.reload();
    }

    pub fn delete_conversation(&mut self, id: i64) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.delete_conversation(id) {
            tracing::error!("Failed to delete conversation {}: {}", id, e);
            self.error_message = Some(e.to_string());
            return;
        }
        if store.current_conversation().is_none() {
            self.reset();
        }
        self.reload();
    }

    /// Prior turns to send with the next prompt; error lines are left out.
    pub fn turns(&self) -> Vec<Turn> {
        self.chat_history
            .iter()
            .filter_map(|(role, content)| Role::parse(role).map(|role| Turn::new(role, content.clone())))
            .collect()
    }

    fn record_user_turn(&mut self, model: &str, prompt: &str) {
        self.chat_history.push(("user".to_string(), prompt.to_string()));
        if let Some(store) = &self.store {
            if let Err(e) = store.insert_user_turn(model, prompt) {
                tracing::error!("Failed to save user message: {}", e);
            }
            // The first prompt names the conversation
            match store.conversations() {
                Ok(conversations) => self.conversations = conversations,
                Err(e) => tracing::warn!("Could not list conversations: {}", e),
            }
        }
    }
}

impl UiAdapter for ChatView {
    fn started(&mut self, _task: TaskId) {
        self.responding = true;
        self.current_response.clear();
        self.error_message = None;
    }

    fn chunk_received(&mut self, _task: TaskId, chunk: &Chunk) {
        if let Chunk::Text(text) = chunk {
            self.current_response.push_str(text);
        }
    }

    fn completed(&mut self, _task: TaskId, result: ResultContainer, _dispatcher: &mut Dispatcher) {
        self.responding = false;
        self.current_response.clear();
        if let Some(store) = &self.store {
            if let Err(e) = store.insert(&result) {
                tracing::error!("Failed to save response: {}", e);
            }
        }
        if !result.content.is_empty() {
            self.chat_history.push(("assistant".to_string(), result.content));
        }
    }

    fn failed(&mut self, _task: TaskId, error: RemoteError, partial: ResultContainer, _dispatcher: &mut Dispatcher) {
        self.responding = false;
        self.current_response.clear();
        // Keep whatever arrived before the failure
        if !partial.content.is_empty() {
            self.chat_history.push(("assistant".to_string(), partial.content));
        }
        self.chat_history.push(("error".to_string(), format!("Error: {}", error)));
        self.error_message = Some(error.to_string());
    }
}

/// Image surface state, driven by lifecycle events.
pub struct ImageView {
    store: Option<Rc<SqliteStore>>,
    settings: ImageConfig,
    pub generating: bool,
    /// Every image of the batch on screen, in arrival order.
    pub batch: Vec<Vec<u8>>,
    pub textures: Vec<Option<egui::TextureHandle>>,
    pub gallery: Vec<StoredImage>,
    pub thumbnails: HashMap<i64, Option<egui::TextureHandle>>,
    pub revised_prompt: Option<String>,
    pub error_message: Option<String>,
    pub saved_to: Vec<PathBuf>,
}

impl ImageView {
    fn new(store: Option<Rc<SqliteStore>>, settings: ImageConfig) -> Self {
        let mut view = Self {
            store,
            settings,
            generating: false,
            batch: Vec::new(),
            textures: Vec::new(),
            gallery: Vec::new(),
            thumbnails: HashMap::new(),
            revised_prompt: None,
            error_message: None,
            saved_to: Vec::new(),
        };
        view.reload_gallery();
        view
    }

    fn reload_gallery(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.recent_images(GALLERY_SIZE) {
            Ok(images) => {
                self.thumbnails.retain(|id, _| images.iter().any(|image| image.id == *id));
                self.gallery = images;
            }
            Err(e) => tracing::warn!("Could not load image history: {}", e),
        }
    }

    /// Put a stored image back on screen.
    pub fn show_stored(&mut self, index: usize) {
        let Some(image) = self.gallery.get(index) else {
            return;
        };
        self.batch = vec![image.data.clone()];
        self.textures.clear();
        self.revised_prompt = image.revised_prompt.clone();
        self.saved_to.clear();
        self.error_message = None;
    }

    /// Upload images that arrived since the last frame to the GPU.
    pub fn upload_textures(&mut self, ctx: &egui::Context) {
        while self.textures.len() < self.batch.len() {
            let index = self.textures.len();
            match decode_texture(ctx, format!("generated_image_{}", index), &self.batch[index]) {
                Ok(texture) => self.textures.push(Some(texture)),
                Err(e) => {
                    self.error_message = Some(format!("Failed to decode image: {}", e));
                    self.textures.push(None);
                }
            }
        }
        for image in &self.gallery {
            self.thumbnails.entry(image.id).or_insert_with(|| {
                decode_texture(ctx, format!("thumbnail_{}", image.id), &image.data)
                    .map_err(|e| tracing::warn!("Could not decode stored image {}: {}", image.id, e))
                    .ok()
            });
        }
    }
}

impl UiAdapter for ImageView {
    fn started(&mut self, _task: TaskId) {
        self.generating = true;
        self.batch.clear();
        self.textures.clear();
        self.error_message = None;
        self.revised_prompt = None;
        self.saved_to.clear();
    }

    fn chunk_received(&mut self, _task: TaskId, chunk: &Chunk) {
        if let Chunk::Image(bytes) = chunk {
            self.batch.push(bytes.clone());
        }
    }

    fn completed(&mut self, _task: TaskId, result: ResultContainer, _dispatcher: &mut Dispatcher) {
        self.generating = false;
        self.revised_prompt = result.revised_prompt.clone();
        if let Some(store) = &self.store {
            if let Err(e) = store.insert(&result) {
                tracing::error!("Failed to save image record: {}", e);
            }
        }
        self.reload_gallery();
        if self.settings.save_images {
            match export::save_images(&self.settings.directory, &result, self.settings.save_prompt_as_text) {
                Ok(paths) => self.saved_to = paths,
                Err(e) => self.error_message = Some(format!("Failed to save image: {}", e)),
            }
        }
    }

    fn failed(&mut self, _task: TaskId, error: RemoteError, _partial: ResultContainer, _dispatcher: &mut Dispatcher) {
        self.generating = false;
        self.error_message = Some(error.to_string());
    }
}

pub struct ChatApp {
    pub config: AppConfig,
    pub config_path: PathBuf,
    pub chat: Dispatcher,
    pub chat_view: ChatView,
    pub image: Dispatcher,
    pub image_view: ImageView,
    pub input: String,
    pub json_input: String,
    pub attachments: Vec<ImageAttachment>,
    pub attachment_path: String,
    pub image_prompt: String,
    pub show_settings: bool,
    pub available_models: Vec<String>,
    pub models_request: Option<Promise<Result<Vec<String>, RemoteError>>>,
    pub error_message: Option<String>,
    pub active_tab: usize,
}

impl ChatApp {
    pub fn new(_cc: &eframe::CreationContext<'_>, config: AppConfig, config_path: PathBuf) -> Self {
        let store = match SqliteStore::open(&config.database_path) {
            Ok(store) => Some(Rc::new(store)),
            Err(e) => {
                tracing::error!("Could not open database {:?}: {}", config.database_path, e);
                None
            }
        };

        let chat = Dispatcher::new("chat", Arc::new(LLMClient::from_config(&config.chat)));
        let image = Dispatcher::new("image", Arc::new(ImageClient::from_config(&config.image)));

        Self {
            chat_view: ChatView::new(store.clone()),
            image_view: ImageView::new(store, config.image.clone()),
            chat,
            image,
            config,
            config_path,
            input: String::new(),
            json_input: String::new(),
            attachments: Vec::new(),
            attachment_path: String::new(),
            image_prompt: String::new(),
            show_settings: false,
            available_models: Vec::new(),
            models_request: None,
            error_message: None,
            active_tab: 0,
        }
    }

    pub fn refresh_models(&mut self) {
        if self.models_request.is_some() {
            return;
        }
        self.error_message = None; // Clear any previous errors

        let client = LLMClient::from_config(&self.config.chat);
        self.models_request = Some(Promise::spawn_thread("list_models", move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(RemoteError::Runtime)?;
            runtime.block_on(client.list_models())
        }));
    }

    fn poll_models(&mut self) {
        let Some(request) = self.models_request.take() else {
            return;
        };
        match request.try_take() {
            Ok(Ok(models)) => {
                // Select the first model if the configured one is gone
                if !models.is_empty() && !models.contains(&self.config.chat.model) {
                    self.config.chat.model = models[0].clone();
                }
                self.available_models = models;
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to fetch models: {}", e);
                self.error_message = Some(format!("Failed to fetch models: {}", e));
            }
            Err(pending) => self.models_request = Some(pending),
        }
    }

    pub fn send_message(&mut self) {
        if self.input.trim().is_empty() || self.chat.is_busy() {
            return;
        }

        let prompt = self.input.trim().to_string();
        let json_body = (!self.json_input.trim().is_empty()).then(|| self.json_input.clone());
        let request = self
            .config
            .chat
            .descriptor(&prompt, &self.chat_view.turns(), self.attachments.clone(), json_body);

        match self.chat.submit(request, &mut self.chat_view) {
            Ok(_) => {
                self.chat_view.record_user_turn(&self.config.chat.model, &prompt);
                self.input.clear();
                self.attachments.clear();
            }
            Err(e) => self.chat_view.error_message = Some(e.to_string()),
        }
    }

    /// Attach the image file named in the path field.
    pub fn attach_image_path(&mut self) {
        let path = self.attachment_path.trim().to_string();
        if path.is_empty() {
            return;
        }
        if self.attach_file(Path::new(&path)) {
            self.attachment_path.clear();
        }
    }

    fn attach_file(&mut self, path: &Path) -> bool {
        match ImageAttachment::from_path(path) {
            Ok(attachment) => {
                tracing::debug!("Attached {:?} ({})", path, attachment.mime);
                self.attachments.push(attachment);
                true
            }
            Err(e) => {
                self.chat_view.error_message = Some(e.to_string());
                false
            }
        }
    }

    /// Images dropped onto the window while the chat tab is idle become attachments.
    fn take_dropped_files(&mut self, ctx: &egui::Context) {
        let dropped = ctx.input(|i| i.raw.dropped_files.clone());
        if dropped.is_empty() || self.active_tab != 0 || self.chat_view.responding {
            return;
        }
        for file in dropped {
            if let Some(path) = &file.path {
                self.attach_file(path);
            } else if let Some(bytes) = &file.bytes {
                match ImageAttachment::from_bytes(bytes.to_vec()) {
                    Ok(attachment) => self.attachments.push(attachment),
                    Err(e) => self.chat_view.error_message = Some(format!("{}: {}", file.name, e)),
                }
            }
        }
    }

    pub fn remove_attachment(&mut self, index: usize) {
        if index < self.attachments.len() {
            self.attachments.remove(index);
        }
    }

    pub fn stop_response(&mut self) {
        if self.chat.stop() {
            self.chat_view.responding = false;
            self.chat_view.current_response.clear();
        }
    }

    pub fn generate_image(&mut self) {
        if self.image.is_busy() {
            return;
        }
        let request = self.config.image.descriptor(self.image_prompt.trim());
        if let Err(e) = self.image.submit(request, &mut self.image_view) {
            self.image_view.error_message = Some(e.to_string());
        }
    }

    pub fn stop_image(&mut self) {
        if self.image.stop() {
            self.image_view.generating = false;
        }
    }

    pub fn update_endpoint_type(&mut self, endpoint_type: EndpointType) {
        self.config.chat.endpoint_type = endpoint_type;
        self.config.chat.base_url = endpoint_type.default_base_url().to_string();
        self.available_models.clear();
    }

    /// Rebuild the clients from the edited settings and write them to disk.
    pub fn apply_settings(&mut self) {
        self.chat.set_backend(Arc::new(LLMClient::from_config(&self.config.chat)));
        self.image.set_backend(Arc::new(ImageClient::from_config(&self.config.image)));
        self.image_view.settings = self.config.image.clone();
        if let Err(e) = self.config.save(&self.config_path) {
            tracing::error!("{:#}", e);
            self.error_message = Some(format!("{:#}", e));
        }
    }

    /// Start a new conversation; the previous one stays in the list.
    pub fn clear_chat(&mut self) {
        self.chat.stop();
        self.chat_view.new_conversation();
        self.input.clear();
        self.json_input.clear();
        self.attachments.clear();
    }

    pub fn open_conversation(&mut self, id: i64) {
        if self.chat_view.current_conversation() == Some(id) {
            return;
        }
        self.chat.stop();
        self.chat_view.open_conversation(id);
    }

    pub fn delete_conversation(&mut self, id: i64) {
        if self.chat_view.current_conversation() == Some(id) {
            self.chat.stop();
        }
        self.chat_view.delete_conversation(id);
    }

    /// Forward worker events to both surfaces.
    pub fn process_events(&mut self, ctx: &egui::Context) {
        let chat = self.chat.poll(&mut self.chat_view);
        let image = self.image.poll(&mut self.image_view);
        self.poll_models();
        self.take_dropped_files(ctx);
        if chat || image {
            ctx.request_repaint();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_workbench::RequestDescriptor;

    fn image_dispatcher() -> Dispatcher {
        Dispatcher::new("image", Arc::new(ImageClient::from_config(&ImageConfig::default())))
    }

    #[test]
    fn test_new_chat_is_not_reloaded_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.db");
        {
            let mut view = ChatView::new(Some(Rc::new(SqliteStore::open(&path).unwrap())));
            view.record_user_turn("m", "secret old topic");
            assert_eq!(view.conversations[0].title, "secret old topic");
            view.new_conversation();
            assert!(view.chat_history.is_empty());
            assert_eq!(view.conversations.len(), 2);
        }

        let view = ChatView::new(Some(Rc::new(SqliteStore::open(&path).unwrap())));
        assert!(view.chat_history.is_empty());
        assert!(view.turns().is_empty());
    }

    #[test]
    fn test_switching_conversations_swaps_history() {
        let store = Rc::new(SqliteStore::open_in_memory().unwrap());
        let mut view = ChatView::new(Some(Rc::clone(&store)));
        view.record_user_turn("m", "first thread");
        let first = view.current_conversation().unwrap();
        view.new_conversation();
        view.record_user_turn("m", "second thread");

        view.open_conversation(first);
        assert_eq!(view.chat_history, vec![("user".to_string(), "first thread".to_string())]);

        view.delete_conversation(first);
        assert!(view.chat_history.is_empty());
        assert_eq!(view.conversations.len(), 1);
    }

    #[test]
    fn test_whole_batch_is_kept_and_stored() {
        let store = Rc::new(SqliteStore::open_in_memory().unwrap());
        let mut view = ImageView::new(Some(store), ImageConfig::default());
        let mut dispatcher = image_dispatcher();

        view.started(1);
        view.chunk_received(1, &Chunk::Image(vec![1]));
        view.chunk_received(1, &Chunk::Image(vec![2]));
        assert_eq!(view.batch, vec![vec![1], vec![2]]);

        let mut result = ResultContainer::for_request(&RequestDescriptor::image("dall-e-3", "two cats"));
        result.images = view.batch.clone();
        view.completed(1, result, &mut dispatcher);
        assert_eq!(view.gallery.len(), 2);

        view.show_stored(1);
        assert_eq!(view.batch, vec![vec![1]]);

        view.started(2);
        assert!(view.batch.is_empty());
        assert!(view.textures.is_empty());
    }
}
