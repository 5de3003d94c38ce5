use crate::data::CycleSummary;
use crate::persistence::{CleanedPriceRecord, PriceStore};
use axum::extract::ws::Message;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::routing::get;
use axum::{Json, Router};
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

struct AppState<P: PriceStore> {
    store: Arc<P>,
}

impl<P: PriceStore> Clone for AppState<P> {
    fn clone(&self) -> Self {
        AppState {
            store: self.store.clone(),
        }
    }
}

pub fn run_web_server(
    cancellation_token: CancellationToken,
    summary_sender: Sender<CycleSummary>,
    store: Arc<impl PriceStore + 'static>,
    host: String,
    port: u32,
) -> JoinHandle<()> {
    let mut router = Router::new()
        .route("/api/v1/listings", get(get_listings_handler))
        .with_state(AppState {
            store: store.clone(),
        });

    router = serve_static_dir(router);
    router = configure_ws(router, cancellation_token.clone(), summary_sender.clone());

    let _cancellation_token = cancellation_token.clone();
    let url = format!("{host}:{port}");

    tokio::spawn(async move {
        serve(_cancellation_token, router, url).await;
    })
}

fn serve_static_dir(router: Router) -> Router {
    router.nest_service("/", ServeDir::new("static"))
}

async fn get_listings_handler(
    State(state): State<AppState<impl PriceStore>>,
) -> Json<Vec<CleanedPriceRecord>> {
    let since = chrono::Utc::now() - chrono::Duration::minutes(15);

    let listings = state
        .store
        .listings_since(since)
        .await
        .unwrap_or_else(|e| {
            error!("Error fetching listings: {e}");
            vec![]
        });

    axum::response::Json(listings)
}

fn configure_ws(
    router: Router,
    cancellation_token: CancellationToken,
    summary_sender: Sender<CycleSummary>,
) -> Router {
    router.route(
        "/ws/listings",
        get(
            |ws: WebSocketUpgrade,
             connect_info: ConnectInfo<SocketAddr>| async move {
                debug!("Connected {connect_info:?}");

                ws.on_upgrade(async move |mut socket| {
                    debug!("Connected  upgrade {connect_info:?}");

                    if socket.send(Message::Ping(vec![1, 2, 3])).await.is_ok() {
                        debug!("Pinged ...");
                    } else {
                        error!("Could not send ping !");
                    }

                    let mut summary_receiver: Receiver<CycleSummary> = summary_sender.subscribe();
                    loop {
                        tokio::select! {
                              data = summary_receiver.recv() => {
                                  match data {
                                      Ok(summary) => {
                                          let msg = serde_json::to_string(&summary).unwrap();
                                          if let Err(e) = socket.send(Message::Text(msg)).await {
                                              error!("Error sending message: {e}");
                                              break;
                                          }
                                      }
                                      Err(_) => {
                                          error!("Receiver channel closed");
                                          break;
                                      }
                                  }
                              },
                              _ = cancellation_token.cancelled() => {
                                    debug!("Cancellation requested, closing WebSocket connection...");
                                    if let Err(e) = socket.close().await {
                                        error!("Error closing WebSocket: {e}");
                                    }
                                    break;
                                }
                        }
                    }
                })
            },
        ),
    )
}

async fn serve(cancellation_token: CancellationToken, app: Router, addr: String) {
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    info!("listening on {}", listener.local_addr().unwrap());

    tokio::select! {
        _ = cancellation_token.cancelled() => {
            info!("Cancellation requested, exiting...");
        }
        _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            info!("Server stopped");
        }
    }
}
