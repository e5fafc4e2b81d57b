use eframe::egui;
use std::time::Duration;

use llm_workbench::config::ImageProvider;
use llm_workbench::endpoint_type::EndpointType;

use crate::chatapp::ChatApp;

const THUMBNAIL_SIZE: f32 = 64.0;

impl eframe::App for ChatApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // Keep polling workers while something is running (16ms = ~60 FPS)
        if self.chat.is_busy() || self.image.is_busy() || self.models_request.is_some() {
            ctx.request_repaint_after(Duration::from_millis(16));
        }

        self.process_events(ctx);

        // Top menu bar
        egui::TopBottomPanel::top("menu_bar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui.button("☰").clicked() {
                    self.show_settings = !self.show_settings;
                    if self.show_settings && self.available_models.is_empty() {
                        self.refresh_models();
                    }
                }
                ui.label("LLM Workbench");
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if ui.button("New Chat").clicked() {
                        self.clear_chat();
                    }
                });
            });
        });

        egui::TopBottomPanel::top("tab_bar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.selectable_value(&mut self.active_tab, 0, "Chat");
                ui.selectable_value(&mut self.active_tab, 1, "Image");
            });
        });

        if self.show_settings {
            self.show_settings_window(ctx);
        }

        egui::CentralPanel::default().show(ctx, |ui| match self.active_tab {
            1 => self.render_image_tab(ui, ctx),
            _ => self.render_chat_tab(ui),
        });
    }
}

impl ChatApp {
    fn render_chat_tab(&mut self, ui: &mut egui::Ui) {
        egui::SidePanel::left("conversations")
            .resizable(true)
            .default_width(180.0)
            .show_inside(ui, |ui| self.render_conversations(ui));

        let available_height = ui.available_height();
        let mut input_area_height = if self.config.chat.json_object { 210.0 } else { 130.0 };
        if !self.attachments.is_empty() {
            input_area_height += 24.0;
        }

        ui.vertical(|ui| {
            egui::ScrollArea::vertical()
                .auto_shrink([false; 2])
                .stick_to_bottom(true)
                .max_height(available_height - input_area_height)
                .show(ui, |ui| {
                    self.render_chat_history(ui);
                    self.render_current_response(ui);
                });

            ui.add_space(8.0);

            ui.group(|ui| {
                ui.set_min_height(input_area_height);

                ui.vertical(|ui| {
                    // Input is disabled while a response is streaming
                    let idle = !self.chat_view.responding;
                    let input = ui.add_enabled(
                        idle,
                        egui::TextEdit::multiline(&mut self.input)
                            .hint_text("Type your message here... (Press Enter to send, Shift+Enter for new line)")
                            .desired_width(f32::INFINITY)
                            .desired_rows(3),
                    );

                    if self.config.chat.json_object {
                        ui.add_enabled(
                            idle,
                            egui::TextEdit::multiline(&mut self.json_input)
                                .hint_text("JSON content")
                                .code_editor()
                                .desired_width(f32::INFINITY)
                                .desired_rows(3),
                        );
                    }

                    self.render_attachments(ui, idle);

                    ui.horizontal(|ui| {
                        let (enter, shift) = ui.input(|i| (i.key_pressed(egui::Key::Enter), i.modifiers.shift));
                        if idle {
                            if ui.button("Send").clicked() || is_send_shortcut(input.has_focus(), enter, shift) {
                                self.send_message();
                            }
                        } else {
                            ui.spinner();
                            if ui.button("Stop").clicked() {
                                self.stop_response();
                            }
                        }
                        if let Some(error) = &self.chat_view.error_message {
                            ui.colored_label(egui::Color32::RED, error);
                        }
                    });
                });
            });
        });
    }

    fn render_conversations(&mut self, ui: &mut egui::Ui) {
        let idle = !self.chat_view.responding;
        ui.add_enabled_ui(idle, |ui| {
            if ui.button("➕ New Chat").clicked() {
                self.clear_chat();
            }
        });
        ui.separator();

        let current = self.chat_view.current_conversation();
        let mut open = None;
        let mut delete = None;
        egui::ScrollArea::vertical().show(ui, |ui| {
            for conversation in &self.chat_view.conversations {
                ui.horizontal(|ui| {
                    ui.add_enabled_ui(idle, |ui| {
                        if ui.small_button("🗑").on_hover_text("Delete conversation").clicked() {
                            delete = Some(conversation.id);
                        }
                        let selected = current == Some(conversation.id);
                        if ui
                            .selectable_label(selected, conversation.title.as_str())
                            .on_hover_text(conversation.created_at.format("%Y-%m-%d %H:%M").to_string())
                            .clicked()
                        {
                            open = Some(conversation.id);
                        }
                    });
                });
            }
        });

        if let Some(id) = delete {
            self.delete_conversation(id);
        } else if let Some(id) = open {
            self.open_conversation(id);
        }
    }

    fn render_attachments(&mut self, ui: &mut egui::Ui, idle: bool) {
        ui.add_enabled_ui(idle, |ui| {
            ui.horizontal(|ui| {
                ui.add(
                    egui::TextEdit::singleline(&mut self.attachment_path)
                        .hint_text("Image path (or drop a file on the window)")
                        .desired_width(280.0),
                );
                if ui.button("📎 Attach").clicked() {
                    self.attach_image_path();
                }
            });

            if !self.attachments.is_empty() {
                let mut remove = None;
                ui.horizontal_wrapped(|ui| {
                    for (index, attachment) in self.attachments.iter().enumerate() {
                        let label = format!("{} ({} KB) ✖", attachment.mime, attachment.bytes.len() / 1024);
                        if ui.small_button(label).on_hover_text("Remove attachment").clicked() {
                            remove = Some(index);
                        }
                    }
                });
                if let Some(index) = remove {
                    self.remove_attachment(index);
                }
            }
        });
    }

    fn render_image_tab(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        self.image_view.upload_textures(ctx);

        if !self.image_view.gallery.is_empty() {
            egui::TopBottomPanel::bottom("image_gallery")
                .resizable(false)
                .show_inside(ui, |ui| self.render_gallery(ui));
        }

        let available_height = ui.available_height();
        let image_area_height = available_height * 0.7;
        let input_area_height = available_height * 0.3;

        ui.vertical(|ui| {
            ui.allocate_ui_with_layout(
                egui::vec2(ui.available_width(), image_area_height),
                egui::Layout::centered_and_justified(egui::Direction::TopDown),
                |ui| {
                    egui::Frame::dark_canvas(ui.style()).show(ui, |ui| {
                        let textures: Vec<&egui::TextureHandle> = self.image_view.textures.iter().flatten().collect();
                        if !textures.is_empty() {
                            render_batch(ui, &textures);
                        } else if self.image_view.generating {
                            ui.spinner();
                        } else if let Some(error) = &self.image_view.error_message {
                            ui.vertical_centered(|ui| {
                                ui.colored_label(egui::Color32::RED, "Generation failed!");
                                ui.add_space(10.0);
                                ui.label(error);
                            });
                        } else {
                            ui.heading("Enter a prompt below to generate an image");
                        }
                    });
                },
            );

            ui.separator();

            ui.allocate_ui_with_layout(
                egui::vec2(ui.available_width(), input_area_height),
                egui::Layout::top_down(egui::Align::LEFT),
                |ui| {
                    let idle = !self.image_view.generating;
                    ui.add_enabled(
                        idle,
                        egui::TextEdit::multiline(&mut self.image_prompt)
                            .desired_rows(3)
                            .desired_width(f32::INFINITY)
                            .hint_text("A beautiful landscape with mountains and lakes..."),
                    );

                    ui.horizontal(|ui| {
                        if idle {
                            if ui.button("Generate Image").clicked() {
                                self.generate_image();
                            }
                        } else {
                            ui.spinner();
                            if ui.button("Stop").clicked() {
                                self.stop_image();
                            }
                        }
                    });

                    if let Some(prompt) = &self.image_view.revised_prompt {
                        ui.label(format!("Revised prompt: {}", prompt));
                    }
                    for path in &self.image_view.saved_to {
                        ui.label(format!("Saved to {}", path.display()));
                    }
                    if !self.image_view.batch.is_empty() {
                        if let Some(error) = &self.image_view.error_message {
                            ui.colored_label(egui::Color32::RED, error);
                        }
                    }
                },
            );
        });
    }

    fn render_gallery(&mut self, ui: &mut egui::Ui) {
        let idle = !self.image_view.generating;
        let mut picked = None;
        egui::ScrollArea::horizontal().show(ui, |ui| {
            ui.horizontal(|ui| {
                for (index, image) in self.image_view.gallery.iter().enumerate() {
                    let Some(Some(texture)) = self.image_view.thumbnails.get(&image.id) else {
                        continue;
                    };
                    let thumbnail = egui::ImageButton::new(
                        egui::Image::from_texture(texture).fit_to_exact_size(egui::vec2(THUMBNAIL_SIZE, THUMBNAIL_SIZE)),
                    );
                    if ui.add_enabled(idle, thumbnail).on_hover_text(image.prompt.as_str()).clicked() {
                        picked = Some(index);
                    }
                }
            });
        });
        if let Some(index) = picked {
            self.image_view.show_stored(index);
        }
    }

    fn render_chat_history(&self, ui: &mut egui::Ui) {
        for (role, content) in &self.chat_view.chat_history {
            let is_user = role == "user";
            let is_error = role == "error";
            ui.horizontal(|ui| {
                if is_user {
                    ui.label(egui::RichText::new("You: ").strong());
                } else if is_error {
                    ui.label(egui::RichText::new("Error: ").strong().color(egui::Color32::RED));
                } else {
                    ui.label(egui::RichText::new("LLM: ").strong());
                }
            });
            if is_error {
                ui.label(egui::RichText::new(content).color(egui::Color32::RED));
            } else {
                render_message_content(ui, content);
            }
            ui.add_space(8.0);
        }
    }

    fn render_current_response(&self, ui: &mut egui::Ui) {
        if !self.chat_view.current_response.is_empty() {
            ui.label(egui::RichText::new("LLM: ").strong());
            render_message_content(ui, &self.chat_view.current_response);
        }
    }

    fn show_settings_window(&mut self, ctx: &egui::Context) {
        let mut show_settings = self.show_settings;
        egui::Window::new("Settings")
            .open(&mut show_settings)
            .resizable(false)
            .default_width(400.0)
            .show(ctx, |ui| {
                self.render_chat_settings(ui);
                ui.separator();
                self.render_image_settings(ui);
                ui.separator();

                if ui.button("Apply and Save").clicked() {
                    self.apply_settings();
                }
                if let Some(error) = &self.error_message {
                    ui.colored_label(egui::Color32::RED, error);
                }
            });
        self.show_settings = show_settings;
    }

    fn render_chat_settings(&mut self, ui: &mut egui::Ui) {
        ui.heading("Chat");
        ui.add_space(8.0);

        ui.horizontal(|ui| {
            ui.label("Endpoint Type:");
            let mut endpoint_type = self.config.chat.endpoint_type;
            for candidate in [EndpointType::OpenAiCompatible, EndpointType::Ollama] {
                if ui.radio_value(&mut endpoint_type, candidate, candidate.label()).clicked() {
                    self.update_endpoint_type(endpoint_type);
                }
            }
        });

        egui::Grid::new("chat_settings_grid")
            .num_columns(2)
            .spacing([8.0, 4.0])
            .show(ui, |ui| {
                ui.label("Base URL:");
                ui.text_edit_singleline(&mut self.config.chat.base_url);
                ui.end_row();

                ui.label("Model:");
                ui.horizontal(|ui| {
                    egui::ComboBox::from_id_source("model_select")
                        .selected_text(&self.config.chat.model)
                        .show_ui(ui, |ui| {
                            for model in &self.available_models {
                                ui.selectable_value(&mut self.config.chat.model, model.clone(), model);
                            }
                        });
                    if ui.button("⟳").on_hover_text("Refresh model list").clicked() {
                        self.refresh_models();
                    }
                    if self.models_request.is_some() {
                        ui.spinner();
                    }
                });
                ui.end_row();

                ui.label("System:");
                ui.text_edit_multiline(&mut self.config.chat.system);
                ui.end_row();
            });

        ui.add(egui::Slider::new(&mut self.config.chat.temperature, 0.0..=2.0).text("Temperature"));
        ui.add(egui::Slider::new(&mut self.config.chat.top_p, 0.0..=1.0).text("Top P"));
        ui.add(egui::Slider::new(&mut self.config.chat.frequency_penalty, -2.0..=2.0).text("Frequency Penalty"));
        ui.add(egui::Slider::new(&mut self.config.chat.presence_penalty, -2.0..=2.0).text("Presence Penalty"));
        ui.horizontal(|ui| {
            ui.checkbox(&mut self.config.chat.use_max_tokens, "Max Tokens");
            ui.add_enabled(
                self.config.chat.use_max_tokens,
                egui::Slider::new(&mut self.config.chat.max_tokens, 256..=8192),
            );
        });
        ui.add(
            egui::Slider::new(&mut self.config.chat.maximum_messages_in_parameter, 0..=50)
                .text("Messages sent as context"),
        );
        ui.checkbox(&mut self.config.chat.stream, "Stream");
        ui.checkbox(&mut self.config.chat.json_object, "JSON response");
    }

    fn render_image_settings(&mut self, ui: &mut egui::Ui) {
        ui.heading("Image");
        ui.add_space(8.0);

        let image = &mut self.config.image;
        ui.horizontal(|ui| {
            ui.label("Provider:");
            for (provider, label) in [(ImageProvider::OpenAi, "OpenAI"), (ImageProvider::Automatic1111, "Automatic1111")] {
                if ui.radio_value(&mut image.provider, provider, label).clicked() {
                    image.base_url = provider.default_base_url().to_string();
                }
            }
        });

        egui::Grid::new("image_settings_grid")
            .num_columns(2)
            .spacing([8.0, 4.0])
            .show(ui, |ui| {
                ui.label("API URL:");
                ui.text_edit_singleline(&mut image.base_url);
                ui.end_row();

                ui.label("Model:");
                ui.text_edit_singleline(&mut image.model);
                ui.end_row();

                ui.label("Size:");
                ui.horizontal(|ui| {
                    ui.add(egui::DragValue::new(&mut image.width).clamp_range(64..=2048));
                    ui.label("x");
                    ui.add(egui::DragValue::new(&mut image.height).clamp_range(64..=2048));
                });
                ui.end_row();

                ui.label("Count:");
                ui.add(egui::DragValue::new(&mut image.count).clamp_range(1..=10));
                ui.end_row();
            });

        if image.provider == ImageProvider::Automatic1111 {
            ui.add(egui::Slider::new(&mut image.steps, 1..=150).text("Steps"));
            ui.add(egui::Slider::new(&mut image.cfg_scale, 1.0..=30.0).text("CFG Scale"));
        }
        ui.checkbox(&mut image.save_images, "Save generated images");
        ui.add_enabled(
            image.save_images,
            egui::Checkbox::new(&mut image.save_prompt_as_text, "Save prompt as text"),
        );
    }
}

/// Enter sends from the chat input; Shift+Enter inserts a newline.
fn is_send_shortcut(input_focused: bool, enter: bool, shift: bool) -> bool {
    input_focused && enter && !shift
}

/// Lay out a batch side by side, each scaled to fit its share of the space.
fn render_batch(ui: &mut egui::Ui, textures: &[&egui::TextureHandle]) {
    let max_size = ui.available_size();
    let slot = egui::vec2(max_size.x / textures.len() as f32, max_size.y);
    ui.horizontal_centered(|ui| {
        for texture in textures {
            let size = texture.size_vec2();
            let ratio = (slot.x / size.x).min(slot.y / size.y);
            ui.add(egui::Image::from_texture(*texture).fit_to_exact_size(size * ratio));
        }
    });
}

/// Render text, setting `<think>` sections apart.
fn render_message_content(ui: &mut egui::Ui, content: &str) {
    let parts: Vec<&str> = content.split("<think>").collect();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            ui.label(*part);
            continue;
        }
        let (thinking, rest) = part.split_once("</think>").unwrap_or((*part, ""));
        if !thinking.is_empty() {
            egui::Frame::none()
                .fill(egui::Color32::from_rgb(47, 45, 56))
                .inner_margin(egui::Margin::same(8.0))
                .show(ui, |ui| {
                    ui.label(
                        egui::RichText::new("🤔 Thinking...")
                            .color(egui::Color32::from_rgb(167, 139, 250))
                            .strong(),
                    );
                    ui.label(egui::RichText::new(thinking).color(egui::Color32::LIGHT_GRAY));
                });
        }
        if !rest.is_empty() {
            ui.label(rest);
        }
    }
}
