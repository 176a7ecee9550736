use std::time::Duration;

use async_trait::async_trait;
use log::{error, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

const ACTOR_CHANNEL_SIZE: usize = 8;

#[async_trait]
pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options: Send;
    type Error: From<mpsc::error::SendError<Self::Message>> + std::fmt::Display + Send;

    fn name() -> &'static str;
    fn new(options: Self::Options) -> Self;
    async fn start(&mut self, ctx: &mut ActorContext<Self>) -> Result<(), Self::Error>;
    /// Process one message and return the next action.
    /// This method should only return errors when they are not recoverable.
    /// In such a situation, the actor will be stopped.
    /// If the actor can recover from the error, it should handle it inside the method
    /// and return [Ok].
    /// This method must not invoke blocking functions, otherwise the actor event loop
    /// would stall since all messages are processed sequentially in a single task.
    /// Async operations should be spawned via [ActorContext::spawn] and their results
    /// routed back as messages or through reply channels captured at dispatch time.
    fn receive(
        &mut self,
        ctx: &mut ActorContext<Self>,
        message: Self::Message,
    ) -> Result<ActorAction, Self::Error>;
    async fn stop(self, ctx: &mut ActorContext<Self>) -> Result<(), Self::Error>;
}

pub enum ActorAction {
    Continue,
    Stop,
}

pub struct ActorContext<T: Actor> {
    handle: ActorHandle<T>,
    /// A set of tasks spawned by the actor when processing messages.
    /// All these tasks will be aborted when the context is dropped.
    tasks: JoinSet<Result<(), T::Error>>,
}

impl<T: Actor> ActorContext<T> {
    pub fn new(handle: &ActorHandle<T>) -> Self {
        Self {
            handle: handle.clone(),
            tasks: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    /// Enqueue a message to the actor itself.
    /// The message is delivered via a spawned task so that the event loop
    /// never blocks on its own mailbox capacity.
    pub fn send(&mut self, message: T::Message) {
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            if handle.send(message).await.is_err() {
                warn!("failed to send message to the {} mailbox", T::name());
            }
            Ok(())
        });
    }

    /// Enqueue a message to the actor itself after a delay.
    /// This is the timer primitive: probes and timeouts are delayed
    /// self-messages carrying a watermark that the handler re-checks.
    pub fn send_with_delay(&mut self, message: T::Message, delay: Duration) {
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            if handle.send(message).await.is_err() {
                warn!("failed to send delayed message to the {} mailbox", T::name());
            }
            Ok(())
        });
    }

    /// Spawn a task and save the handle in the context.
    pub fn spawn(
        &mut self,
        task: impl std::future::Future<Output = Result<(), T::Error>> + Send + 'static,
    ) -> AbortHandle {
        self.tasks.spawn(task)
    }

    /// Join tasks that have completed and log errors.
    /// When the actor expects to handle errors, it should add the logic
    /// inside the task (e.g. sending itself a message on error).
    /// Any unhandled errors will be logged here.
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            let result = match result {
                Ok(x) => x,
                Err(e) => {
                    if !e.is_cancelled() {
                        error!("failed to join task spawned by actor: {e}");
                    }
                    continue;
                }
            };
            match result {
                Ok(()) => {}
                Err(e) => {
                    error!("actor task failed: {e}");
                    continue;
                }
            }
        }
    }
}

pub struct ActorHandle<T: Actor> {
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T: Actor> Clone for ActorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    pub fn new(options: T::Options) -> Self {
        let (tx, rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel::<bool>(false);
        let handle = Self {
            sender: tx,
            stopped: stopped_rx,
        };
        let runner = ActorRunner {
            actor: T::new(options),
            ctx: ActorContext::new(&handle),
            receiver: rx,
            stopped: stopped_tx,
        };
        // The handle to the actor event loop task is not saved anywhere.
        // The actor runs "detached" and the event loop task stops by itself
        // when the stop action is taken or all senders are dropped.
        tokio::spawn(runner.run());
        handle
    }

    pub async fn send(&self, message: T::Message) -> Result<(), T::Error> {
        self.sender.send(message).await.map_err(T::Error::from)
    }

    pub async fn wait_for_stop(mut self) {
        // We ignore the receiver error since the sender must have been dropped
        // in this case, which means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

struct ActorRunner<T: Actor> {
    actor: T,
    ctx: ActorContext<T>,
    receiver: mpsc::Receiver<T::Message>,
    stopped: watch::Sender<bool>,
}

impl<T: Actor> ActorRunner<T> {
    async fn run(mut self) {
        let out = async {
            self.actor.start(&mut self.ctx).await?;
            while let Some(message) = self.receiver.recv().await {
                let action = self.actor.receive(&mut self.ctx, message)?;
                match action {
                    ActorAction::Continue => {}
                    ActorAction::Stop => {
                        break;
                    }
                }
                self.ctx.reap();
            }
            self.actor.stop(&mut self.ctx).await
        }
        .await;
        match out {
            Ok(()) => {}
            Err(e) => {
                error!("actor {} failed: {e}", T::name());
            }
        }
        let _ = self.stopped.send(true);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{mpsc, oneshot};

    use super::*;

    struct TestActor {
        counter: u64,
    }

    #[derive(Debug)]
    struct TestError;

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }

    impl<T> From<mpsc::error::SendError<T>> for TestError {
        fn from(_: mpsc::error::SendError<T>) -> Self {
            Self
        }
    }

    enum TestMessage {
        Add {
            value: u64,
            reply: oneshot::Sender<u64>,
        },
        AddLater {
            value: u64,
            delay: Duration,
        },
        Read {
            reply: oneshot::Sender<u64>,
        },
        Stop,
    }

    #[async_trait]
    impl Actor for TestActor {
        type Message = TestMessage;
        type Options = ();
        type Error = TestError;

        fn name() -> &'static str {
            "TestActor"
        }

        fn new(_options: Self::Options) -> Self {
            Self { counter: 0 }
        }

        async fn start(&mut self, _: &mut ActorContext<Self>) -> Result<(), Self::Error> {
            Ok(())
        }

        fn receive(
            &mut self,
            ctx: &mut ActorContext<Self>,
            message: Self::Message,
        ) -> Result<ActorAction, Self::Error> {
            match message {
                TestMessage::Add { value, reply } => {
                    self.counter += value;
                    let _ = reply.send(self.counter);
                    Ok(ActorAction::Continue)
                }
                TestMessage::AddLater { value, delay } => {
                    let (tx, _rx) = oneshot::channel();
                    ctx.send_with_delay(TestMessage::Add { value, reply: tx }, delay);
                    Ok(ActorAction::Continue)
                }
                TestMessage::Read { reply } => {
                    let _ = reply.send(self.counter);
                    Ok(ActorAction::Continue)
                }
                TestMessage::Stop => Ok(ActorAction::Stop),
            }
        }

        async fn stop(self, _: &mut ActorContext<Self>) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_actor_handle_send() {
        let handle = ActorHandle::<TestActor>::new(());
        let (tx, rx) = oneshot::channel();
        let result = handle
            .send(TestMessage::Add {
                value: 42,
                reply: tx,
            })
            .await;
        assert!(matches!(result, Ok(())));
        assert_eq!(rx.await, Ok(42));
    }

    #[tokio::test]
    async fn test_actor_delayed_self_message() {
        let handle = ActorHandle::<TestActor>::new(());
        handle
            .send(TestMessage::AddLater {
                value: 7,
                delay: Duration::from_millis(10),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (tx, rx) = oneshot::channel();
        handle.send(TestMessage::Read { reply: tx }).await.unwrap();
        assert_eq!(rx.await, Ok(7));
    }

    #[tokio::test]
    async fn test_actor_handle_wait_for_stop() {
        let handle = ActorHandle::<TestActor>::new(());
        let result = handle.send(TestMessage::Stop).await;
        assert!(matches!(result, Ok(())));

        handle.clone().wait_for_stop().await;
        // Multiple handles should be able to wait for the actor to stop.
        handle.wait_for_stop().await;
    }
}
