use chatflow_core::flow::*;
use chatflow_core::types::TagAction;
use chatflow_core::validation::InputType;

/// Fluent constructor for flow definitions in tests.
///
/// `link(a, b)` adds a `default` edge; `edge(a, key, b)` adds any other.
pub struct FlowBuilder {
    flow: FlowDefinition,
}

impl FlowBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            flow: FlowDefinition::new(id, id),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.flow.name = name.to_string();
        self
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.flow.channel_binding = Some(channel.to_string());
        self
    }

    pub fn fallback(mut self, text: &str) -> Self {
        self.flow.fallback_message = Some(text.to_string());
        self
    }

    /// Mark the definition as active version 1.
    pub fn active(mut self) -> Self {
        self.flow.status = FlowStatus::Active;
        if self.flow.version == 0 {
            self.flow.version = 1;
        }
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.flow.version = version;
        self
    }

    pub fn node(mut self, id: &str, kind: NodeKind) -> Self {
        self.flow.nodes.push(Node::new(id, kind));
        self
    }

    pub fn start(self, id: &str) -> Self {
        self.node(id, NodeKind::Start)
    }

    pub fn end(self, id: &str) -> Self {
        self.node(id, NodeKind::End)
    }

    pub fn message(self, id: &str, text: &str) -> Self {
        self.node(
            id,
            NodeKind::Message(MessageProps {
                text: text.to_string(),
                media: None,
            }),
        )
    }

    pub fn menu(self, id: &str, prompt: &str, options: &[&str]) -> Self {
        self.node(
            id,
            NodeKind::Menu(MenuProps {
                prompt: prompt.to_string(),
                options: options.iter().map(|o| MenuOption::new(*o)).collect(),
                retry_prompt: None,
            }),
        )
    }

    pub fn question(self, id: &str, prompt: &str, variable: &str, input_type: InputType) -> Self {
        self.node(
            id,
            NodeKind::Question(QuestionProps {
                prompt: prompt.to_string(),
                variable: variable.to_string(),
                input_type,
                retry_prompt: None,
            }),
        )
    }

    pub fn conditional(self, id: &str, variable: &str, tests: Vec<ConditionTest>) -> Self {
        self.node(
            id,
            NodeKind::Conditional(ConditionalProps {
                variable: variable.to_string(),
                tests,
                case_sensitive: false,
            }),
        )
    }

    pub fn webhook(self, id: &str, props: HttpRequestProps) -> Self {
        self.node(id, NodeKind::Webhook(props))
    }

    pub fn api_request(self, id: &str, props: HttpRequestProps) -> Self {
        self.node(id, NodeKind::ApiRequest(props))
    }

    pub fn language_model(self, id: &str, prompt: &str, variable: &str) -> Self {
        self.node(
            id,
            NodeKind::LanguageModel(LanguageModelProps {
                prompt: prompt.to_string(),
                system_prompt: None,
                model: None,
                temperature: None,
                max_tokens: None,
                history_window: 10,
                variable: variable.to_string(),
                send_reply: true,
                voice: None,
                timeout_secs: None,
                retries: 0,
            }),
        )
    }

    pub fn sub_bot(self, id: &str, base_url: &str, flow_id: &str) -> Self {
        self.node(
            id,
            NodeKind::SubBotDelegate(SubBotProps {
                base_url: base_url.to_string(),
                flow_id: flow_id.to_string(),
                token: None,
                variable: None,
                timeout_secs: None,
                idle_timeout_secs: None,
            }),
        )
    }

    pub fn queue(self, id: &str, queue: &str) -> Self {
        self.node(
            id,
            NodeKind::QueueHandoff(QueueHandoffProps {
                queue: queue.to_string(),
                message: None,
            }),
        )
    }

    pub fn attendant(self, id: &str, attendant: &str) -> Self {
        self.node(
            id,
            NodeKind::AttendantHandoff(AttendantHandoffProps {
                attendant: attendant.to_string(),
                message: None,
            }),
        )
    }

    pub fn tags(self, id: &str, action: TagAction, tags: &[&str]) -> Self {
        self.node(
            id,
            NodeKind::TagOp(TagOpProps {
                action,
                tags: tags.iter().map(|t| t.to_string()).collect(),
            }),
        )
    }

    pub fn switch_flow(self, id: &str, target: &str, carry_variables: bool) -> Self {
        self.node(
            id,
            NodeKind::SwitchFlow(SwitchFlowProps {
                flow_id: chatflow_core::types::FlowId::from_str(target),
                carry_variables,
            }),
        )
    }

    /// `default` edge.
    pub fn link(mut self, from: &str, to: &str) -> Self {
        self.flow.edges.push(Edge::default_of(from, to));
        self
    }

    pub fn edge(mut self, from: &str, key: OutputKey, to: &str) -> Self {
        self.flow.edges.push(Edge::new(from, key, to));
        self
    }

    pub fn build(self) -> FlowDefinition {
        self.flow
    }
}

/// start → message("Hi") → menu(Support→queueA, Sales→queueB, default→end)
pub fn greeting_menu_flow() -> FlowDefinition {
    FlowBuilder::new("greeting")
        .channel("web")
        .start("start")
        .message("hi", "Hi")
        .menu("menu", "How can we help?", &["Support", "Sales"])
        .queue("queue_a", "queueA")
        .queue("queue_b", "queueB")
        .end("end")
        .link("start", "hi")
        .link("hi", "menu")
        .edge("menu", OutputKey::Option(0), "queue_a")
        .edge("menu", OutputKey::Option(1), "queue_b")
        .link("menu", "end")
        .active()
        .build()
}

/// start → question(email) → message("Thanks {{email}}") → end
pub fn email_question_flow() -> FlowDefinition {
    FlowBuilder::new("signup")
        .channel("web")
        .start("start")
        .question("ask", "What's your email?", "email", InputType::Email)
        .message("thanks", "Thanks {{email}}")
        .end("end")
        .link("start", "ask")
        .link("ask", "thanks")
        .link("thanks", "end")
        .active()
        .build()
}
