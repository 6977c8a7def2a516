//! Single-file React app generation.
//!
//! The prompt is assembled from the client's brief: a system prompt, the
//! app's context provider source, its `package.json`, the installed UI
//! components and finally the query. Prior conversation follows.

use super::{parse_payload, stream_chat, Actor, PreparedInput, ValidationError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use teardown_core::chat::{ChatBackend, Message};
use teardown_core::envelope::ActorKind;
use teardown_core::stream::StreamEmitter;
use tokio_util::sync::CancellationToken;

const CODER_SYSTEM_PROMPT: &str = "You help build world class apps. Some important notes:
1. Give the default-exported main component a unique, descriptive name that follows TSX naming conventions. Long names are fine; generic ones like SinglePageApp are not.
2. Always export the main component as the default export; it will be added to routes.tsx.
3. Pages are imported like `import MyPage from \"./pages/MyPage\";`.
4. Import useMemo and any other React hooks from react.
5. Do not wrap the component in an AppProvider. The app root is already wrapped, so useAppContext is available.
6. Import the hook like `import { useAppContext } from '@/context/AppContext';`.
7. For apps that chat over the user's knowledge base, emit `request_knowledge_stream` on the socket with the messages so far and render replies received on `receive_assistant_message`.

<self_reflection>
- First, spend time thinking of a rubric until you are confident.
- Then think deeply about what makes a world-class one-shot web app and build a rubric of 5-7 categories. Do not show it to the user.
- Finally, use the rubric to iterate internally on the best possible solution. If a draft is not at the top of every category, start again.
</self_reflection>";

const CONTEXT_NOTE: &str = "The context is the react context available to the app. To use it import it like `import { AppProvider, useAppContext } from './context/AppContext';`";

const PACKAGES_NOTE: &str = "This is the package.json file for the app. It contains the dependencies and scripts for the app. Build the app with the dependencies available, if you need something not available ask the user to install it.";

const COMPONENTS_NOTE: &str = "These are the installed shadcn components. Use them to build the app. If you need another, tell the user which one you need and ask them to install it. Components like Card have a CardHeader, CardContent, CardFooter, etc. Similarly for charts. Use your knowledge of shadcn components when using them.";

const COMPONENTS_IMPORT_NOTE: &str = "These are the files in the components/ui folder. Import like `import { Button } from '@/components/ui/button';`";

const OUTPUT_NOTE: &str = "Output a single typescript file. One shot the app. Use elegant UI. The base color scheme is grayscale. Use black and white well. I will place it inside the pages folder and add an entry to it in the routes.ts file which is picked up by the react-router. It should work as is without any edits. Take care to ensure it runs as is without any errors. Include comments to explain the code.";

#[derive(Debug, Clone, Deserialize)]
pub struct CodeRequest {
    pub query: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub packages: String,
    #[serde(default)]
    pub components: String,
}

impl CodeRequest {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![
            Message::system(CODER_SYSTEM_PROMPT),
            Message::user(CONTEXT_NOTE),
            Message::user(format!("```typescript\n{}\n```", self.context)),
            Message::user(PACKAGES_NOTE),
            Message::user(format!("```json\n{}\n```", self.packages)),
            Message::user(COMPONENTS_NOTE),
            Message::user(COMPONENTS_IMPORT_NOTE),
            Message::user(format!(
                "Here are the components available to the app: {}",
                self.components
            )),
            Message::user(format!("The user wants you to build:  {}", self.query)),
            Message::user(OUTPUT_NOTE),
        ]
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoricCodeRequest {
    #[serde(default)]
    history: Vec<Message>,
    code_request: CodeRequest,
}

pub struct CoderActor {
    chat: Arc<dyn ChatBackend>,
    model: String,
}

impl CoderActor {
    pub fn new(chat: Arc<dyn ChatBackend>, model: String) -> Self {
        Self { chat, model }
    }
}

#[async_trait]
impl Actor for CoderActor {
    fn kind(&self) -> ActorKind {
        ActorKind::Coder
    }

    fn validate_and_prepare(&self, data: &Value) -> Result<PreparedInput, ValidationError> {
        let request: HistoricCodeRequest = parse_payload(data)?;
        if request.code_request.query.trim().is_empty() {
            return Err(ValidationError::Blank("codeRequest.query"));
        }

        let mut messages = request.code_request.to_messages();
        messages.extend(request.history);
        Ok(PreparedInput::Chat {
            model: self.model.clone(),
            messages,
        })
    }

    async fn produce(
        &self,
        input: PreparedInput,
        emitter: StreamEmitter,
        cancel: CancellationToken,
    ) {
        let PreparedInput::Chat { model, messages } = input else {
            tracing::error!("Coder received a non-chat input");
            return;
        };
        stream_chat(self.chat.as_ref(), &model, &messages, emitter, cancel).await;
    }
}
