use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    config::{UmClientConfig, UmControllerConfig},
    data_model::{
        ComponentStatus, ItemState, SystemComponent, UmId, UmState, UmStatus,
    },
    storage::Storage,
    testing::{component_status, desired_component, init_logging, MemoryStorage, TestUrlTranslator},
    um_controller::{UmClient, UmController},
};

struct UmCommand {
    um_id: String,
    command: &'static str,
    packages: Vec<SystemComponent>,
}

struct TestUmClient {
    um_id: String,
    commands: mpsc::UnboundedSender<UmCommand>,
}

#[async_trait]
impl UmClient for TestUmClient {
    async fn prepare_update(&self, packages: Vec<SystemComponent>) -> Result<()> {
        let _ = self.commands.send(UmCommand {
            um_id: self.um_id.clone(),
            command: "prepare",
            packages,
        });
        Ok(())
    }

    async fn start_update(&self) -> Result<()> {
        let _ = self.commands.send(UmCommand {
            um_id: self.um_id.clone(),
            command: "update",
            packages: Vec::new(),
        });
        Ok(())
    }

    async fn start_apply(&self) -> Result<()> {
        let _ = self.commands.send(UmCommand {
            um_id: self.um_id.clone(),
            command: "apply",
            packages: Vec::new(),
        });
        Ok(())
    }

    async fn start_revert(&self) -> Result<()> {
        let _ = self.commands.send(UmCommand {
            um_id: self.um_id.clone(),
            command: "revert",
            packages: Vec::new(),
        });
        Ok(())
    }

    async fn close(&self) {}
}

/// Test-side stand-in for one update manager client process.
struct TestUm {
    um_id: String,
    controller: Arc<UmController>,
    commands: mpsc::UnboundedReceiver<UmCommand>,
    components: Vec<ComponentStatus>,
}

impl TestUm {
    async fn connect(
        um_id: &str,
        controller: &Arc<UmController>,
        um_state: UmState,
        components: Vec<ComponentStatus>,
    ) -> TestUm {
        let (tx, rx) = mpsc::unbounded_channel();

        controller
            .open_connection(
                UmId::from(um_id),
                Arc::new(TestUmClient {
                    um_id: um_id.to_string(),
                    commands: tx,
                }),
                UmStatus {
                    um_state,
                    components: components.clone(),
                },
            )
            .await
            .expect("can't open connection");

        TestUm {
            um_id: um_id.to_string(),
            controller: controller.clone(),
            commands: rx,
            components,
        }
    }

    async fn expect_command(&mut self, command: &str) -> Vec<SystemComponent> {
        let received = tokio::time::timeout(Duration::from_secs(5), self.commands.recv())
            .await
            .unwrap_or_else(|_| panic!("{}: no {command} command", self.um_id))
            .expect("command channel closed");

        assert_eq!(received.um_id, self.um_id);
        assert_eq!(received.command, command);

        received.packages
    }

    fn set_components(&mut self, components: Vec<ComponentStatus>) {
        self.components = components;
    }

    fn push_component(&mut self, component: ComponentStatus) {
        self.components.push(component);
    }

    async fn send_state(&self, um_state: UmState) {
        self.controller
            .um_status_update(
                UmId::from(self.um_id.as_str()),
                UmStatus {
                    um_state,
                    components: self.components.clone(),
                },
            )
            .await
            .expect("can't send UM state");
    }

    async fn disconnect(&self) {
        self.controller
            .close_connection(UmId::from(self.um_id.as_str()))
            .await
            .expect("can't close connection");
    }
}

fn controller_config(first: &str, second: &str) -> UmControllerConfig {
    UmControllerConfig {
        um_clients: vec![
            UmClientConfig {
                um_id: first.to_string(),
                priority: 1,
                is_local: false,
            },
            UmClientConfig {
                um_id: second.to_string(),
                priority: 10,
                is_local: false,
            },
        ],
        update_ttl: 100,
    }
}

fn new_controller(config: &UmControllerConfig, storage: Arc<MemoryStorage>) -> Arc<UmController> {
    init_logging();

    UmController::new(config, storage, Arc::new(TestUrlTranslator))
}

#[tokio::test]
async fn test_connection() {
    let storage = Arc::new(MemoryStorage::default());
    let config = controller_config("umID1", "umID2");
    let controller = new_controller(&config, storage);

    let _um1 = TestUm::connect(
        "umID1",
        &controller,
        UmState::Idle,
        vec![
            component_status("component1", "1", ItemState::Installed),
            component_status("component2", "1", ItemState::Installed),
        ],
    )
    .await;

    let _um2 = TestUm::connect(
        "umID2",
        &controller,
        UmState::Idle,
        vec![
            component_status("component3", "1", ItemState::Installed),
            component_status("component4", "1", ItemState::Installed),
        ],
    )
    .await;

    // Reconnection supersedes the previous handler for the same UM.
    let _um1_copy = TestUm::connect(
        "umID1",
        &controller,
        UmState::Idle,
        vec![
            component_status("component1", "1", ItemState::Installed),
            component_status("component2", "1", ItemState::Installed),
        ],
    )
    .await;

    let components = controller.get_status().await.unwrap();
    assert_eq!(components.len(), 4);

    controller.close().await;
}

#[tokio::test]
async fn test_unknown_component_id_is_rejected() {
    let storage = Arc::new(MemoryStorage::default());
    let config = controller_config("umID3", "umID4");
    let controller = new_controller(&config, storage);

    let _um3 = TestUm::connect(
        "umID3",
        &controller,
        UmState::Idle,
        vec![component_status("c1", "1", ItemState::Installed)],
    )
    .await;
    let _um4 = TestUm::connect(
        "umID4",
        &controller,
        UmState::Idle,
        vec![component_status("c2", "1", ItemState::Installed)],
    )
    .await;

    let result = controller
        .update_components(vec![desired_component("unowned", "2", "someFile")])
        .await;

    let err = result.expect_err("update must fail for an unowned component id");
    assert!(err.to_string().contains("component id unowned not found"));

    controller.close().await;
}

#[tokio::test]
async fn test_full_update() {
    let storage = Arc::new(MemoryStorage::default());
    let config = controller_config("testUM1", "testUM2");
    let controller = new_controller(&config, storage.clone());

    let mut um1 = TestUm::connect(
        "testUM1",
        &controller,
        UmState::Idle,
        vec![
            component_status("um1C1", "1", ItemState::Installed),
            component_status("um1C2", "1", ItemState::Installed),
        ],
    )
    .await;

    let mut um2 = TestUm::connect(
        "testUM2",
        &controller,
        UmState::Idle,
        vec![
            component_status("um2C1", "1", ItemState::Installed),
            component_status("um2C2", "1", ItemState::Installed),
        ],
    )
    .await;

    let update_components = vec![
        desired_component("um1C2", "2", "someFile"),
        desired_component("um2C1", "2", "someFile"),
        desired_component("um2C2", "2", "someFile"),
    ];

    let update_controller = controller.clone();
    let update_task = tokio::spawn(async move {
        update_controller.update_components(update_components).await
    });

    let packages = um1.expect_command("prepare").await;
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].id, "um1C2");
    assert_eq!(packages[0].url, "file://someFile");
    um1.push_component(component_status("um1C2", "2", ItemState::Installing));
    um1.send_state(UmState::Prepared).await;

    let packages = um2.expect_command("prepare").await;
    assert_eq!(packages.len(), 2);
    um2.push_component(component_status("um2C1", "2", ItemState::Installing));
    um2.push_component(component_status("um2C2", "2", ItemState::Installing));
    um2.send_state(UmState::Prepared).await;

    um1.expect_command("update").await;
    um1.send_state(UmState::Updated).await;

    um2.expect_command("update").await;
    um2.send_state(UmState::Updated).await;

    um1.set_components(vec![
        component_status("um1C1", "1", ItemState::Installed),
        component_status("um1C2", "2", ItemState::Installed),
    ]);
    um1.expect_command("apply").await;
    um1.send_state(UmState::Idle).await;

    um2.set_components(vec![
        component_status("um2C1", "2", ItemState::Installed),
        component_status("um2C2", "2", ItemState::Installed),
    ]);
    um2.expect_command("apply").await;
    um2.send_state(UmState::Idle).await;

    let result = update_task.await.unwrap().unwrap();
    assert!(result.error.is_none());
    assert_eq!(
        result.components,
        vec![
            component_status("um1C1", "1", ItemState::Installed),
            component_status("um1C2", "2", ItemState::Installed),
            component_status("um2C1", "2", ItemState::Installed),
            component_status("um2C2", "2", ItemState::Installed),
        ]
    );

    // The persisted plan is cleared on the final idle transition.
    assert!(storage.components_update_info().unwrap().is_empty());

    controller.close().await;
}

#[tokio::test]
async fn test_full_update_with_disconnect() {
    let storage = Arc::new(MemoryStorage::default());
    let config = controller_config("testUM3", "testUM4");
    let controller = new_controller(&config, storage);

    let mut um3 = TestUm::connect(
        "testUM3",
        &controller,
        UmState::Idle,
        vec![
            component_status("um3C1", "1", ItemState::Installed),
            component_status("um3C2", "1", ItemState::Installed),
        ],
    )
    .await;

    let mut um4 = TestUm::connect(
        "testUM4",
        &controller,
        UmState::Idle,
        vec![
            component_status("um4C1", "1", ItemState::Installed),
            component_status("um4C2", "1", ItemState::Installed),
        ],
    )
    .await;

    let update_components = vec![
        desired_component("um3C2", "2", "someFile"),
        desired_component("um4C1", "2", "someFile"),
        desired_component("um4C2", "2", "someFile"),
    ];

    let update_controller = controller.clone();
    let update_task = tokio::spawn(async move {
        update_controller.update_components(update_components).await
    });

    um3.expect_command("prepare").await;
    um3.push_component(component_status("um3C2", "2", ItemState::Installing));
    um3.send_state(UmState::Prepared).await;

    um4.expect_command("prepare").await;
    um4.push_component(component_status("um4C1", "2", ItemState::Installing));
    um4.push_component(component_status("um4C2", "2", ItemState::Installing));
    um4.send_state(UmState::Prepared).await;

    // um3 receives the start but drops the connection before reporting;
    // the controller reverts to the connection-wait state.
    um3.expect_command("update").await;
    um3.disconnect().await;

    // On reconnect um3 reports the update already happened; the state scan
    // resumes the sequence and drives um4 through its update.
    let um3_components = um3.components.clone();
    let mut um3 = TestUm::connect("testUM3", &controller, UmState::Updated, um3_components).await;

    um4.expect_command("update").await;
    um4.send_state(UmState::Updated).await;

    um3.set_components(vec![
        component_status("um3C1", "1", ItemState::Installed),
        component_status("um3C2", "2", ItemState::Installed),
    ]);
    um3.expect_command("apply").await;
    um3.send_state(UmState::Idle).await;

    um4.set_components(vec![
        component_status("um4C1", "2", ItemState::Installed),
        component_status("um4C2", "2", ItemState::Installed),
    ]);
    um4.expect_command("apply").await;
    um4.send_state(UmState::Idle).await;

    let result = update_task.await.unwrap().unwrap();
    assert!(result.error.is_none());
    assert_eq!(
        result.components,
        vec![
            component_status("um3C1", "1", ItemState::Installed),
            component_status("um3C2", "2", ItemState::Installed),
            component_status("um4C1", "2", ItemState::Installed),
            component_status("um4C2", "2", ItemState::Installed),
        ]
    );

    controller.close().await;
}

#[tokio::test]
async fn test_full_update_with_restart() {
    let storage = Arc::new(MemoryStorage::default());
    let config = controller_config("testUM5", "testUM6");
    let controller = new_controller(&config, storage.clone());

    let mut um5 = TestUm::connect(
        "testUM5",
        &controller,
        UmState::Idle,
        vec![
            component_status("um5C1", "1", ItemState::Installed),
            component_status("um5C2", "1", ItemState::Installed),
        ],
    )
    .await;

    let mut um6 = TestUm::connect(
        "testUM6",
        &controller,
        UmState::Idle,
        vec![
            component_status("um6C1", "1", ItemState::Installed),
            component_status("um6C2", "1", ItemState::Installed),
        ],
    )
    .await;

    let update_components = vec![
        desired_component("um5C2", "2", "someFile"),
        desired_component("um6C1", "2", "someFile"),
        desired_component("um6C2", "2", "someFile"),
    ];

    let update_controller = controller.clone();
    let update_task = tokio::spawn(async move {
        update_controller.update_components(update_components).await
    });

    um5.expect_command("prepare").await;
    um5.push_component(component_status("um5C2", "2", ItemState::Installing));
    um5.send_state(UmState::Prepared).await;

    um6.expect_command("prepare").await;
    um6.push_component(component_status("um6C1", "2", ItemState::Installing));
    um6.push_component(component_status("um6C2", "2", ItemState::Installing));
    um6.send_state(UmState::Prepared).await;

    um5.expect_command("update").await;
    um5.send_state(UmState::Updated).await;

    // Full process restart: the controller is rebuilt from the persisted
    // plan while um5 already updated and um6 is still prepared.
    controller.close().await;
    let _ = update_task.await.unwrap();

    let controller = new_controller(&config, storage.clone());

    let um5_components = um5.components.clone();
    let um6_components = um6.components.clone();

    let mut um5 = TestUm::connect("testUM5", &controller, UmState::Updated, um5_components).await;
    let mut um6 = TestUm::connect("testUM6", &controller, UmState::Prepared, um6_components).await;

    um6.expect_command("update").await;
    um6.send_state(UmState::Updated).await;

    um5.set_components(vec![
        component_status("um5C1", "1", ItemState::Installed),
        component_status("um5C2", "2", ItemState::Installed),
    ]);
    um5.expect_command("apply").await;
    um5.send_state(UmState::Idle).await;

    um6.set_components(vec![
        component_status("um6C1", "2", ItemState::Installed),
        component_status("um6C2", "2", ItemState::Installed),
    ]);
    um6.expect_command("apply").await;
    um6.send_state(UmState::Idle).await;

    let components = controller.get_status().await.unwrap();
    assert_eq!(
        components,
        vec![
            component_status("um5C1", "1", ItemState::Installed),
            component_status("um5C2", "2", ItemState::Installed),
            component_status("um6C1", "2", ItemState::Installed),
            component_status("um6C2", "2", ItemState::Installed),
        ]
    );

    assert!(storage.components_update_info().unwrap().is_empty());

    controller.close().await;
}

#[tokio::test]
async fn test_revert_on_prepare_failure() {
    let storage = Arc::new(MemoryStorage::default());
    let config = controller_config("testUM7", "testUM8");
    let controller = new_controller(&config, storage);

    let mut um7 = TestUm::connect(
        "testUM7",
        &controller,
        UmState::Idle,
        vec![
            component_status("um7C1", "1", ItemState::Installed),
            component_status("um7C2", "1", ItemState::Installed),
        ],
    )
    .await;

    let mut um8 = TestUm::connect(
        "testUM8",
        &controller,
        UmState::Idle,
        vec![
            component_status("um8C1", "1", ItemState::Installed),
            component_status("um8C2", "1", ItemState::Installed),
        ],
    )
    .await;

    let update_components = vec![
        desired_component("um7C2", "2", "someFile"),
        desired_component("um8C1", "2", "someFile"),
        desired_component("um8C2", "2", "someFile"),
    ];

    let update_controller = controller.clone();
    let update_task = tokio::spawn(async move {
        update_controller.update_components(update_components).await
    });

    um7.expect_command("prepare").await;
    um7.push_component(component_status("um7C2", "2", ItemState::Installing));
    um7.send_state(UmState::Prepared).await;

    um8.expect_command("prepare").await;
    um8.push_component(component_status("um8C1", "2", ItemState::Installing));
    um8.push_component(component_status("um8C2", "2", ItemState::Error));
    um8.send_state(UmState::Failed).await;

    um7.set_components(vec![
        component_status("um7C1", "1", ItemState::Installed),
        component_status("um7C2", "1", ItemState::Installed),
    ]);
    um7.expect_command("revert").await;
    um7.send_state(UmState::Idle).await;

    um8.expect_command("revert").await;
    um8.send_state(UmState::Idle).await;

    let result = update_task.await.unwrap().unwrap();
    assert_eq!(
        result.error.as_deref(),
        Some("prepare update failure um testUM8")
    );
    assert_eq!(
        result.components,
        vec![
            component_status("um7C1", "1", ItemState::Installed),
            component_status("um7C2", "1", ItemState::Installed),
            component_status("um8C1", "1", ItemState::Installed),
            component_status("um8C2", "1", ItemState::Installed),
            component_status("um8C2", "2", ItemState::Error),
        ]
    );

    controller.close().await;
}

#[tokio::test]
async fn test_revert_on_update_failure_with_disconnect() {
    let storage = Arc::new(MemoryStorage::default());
    let config = controller_config("testUM11", "testUM12");
    let controller = new_controller(&config, storage);

    let mut um11 = TestUm::connect(
        "testUM11",
        &controller,
        UmState::Idle,
        vec![
            component_status("um11C1", "1", ItemState::Installed),
            component_status("um11C2", "1", ItemState::Installed),
        ],
    )
    .await;

    let mut um12 = TestUm::connect(
        "testUM12",
        &controller,
        UmState::Idle,
        vec![
            component_status("um12C1", "1", ItemState::Installed),
            component_status("um12C2", "1", ItemState::Installed),
        ],
    )
    .await;

    let update_components = vec![
        desired_component("um11C2", "2", "someFile"),
        desired_component("um12C1", "2", "someFile"),
        desired_component("um12C2", "2", "someFile"),
    ];

    let update_controller = controller.clone();
    let update_task = tokio::spawn(async move {
        update_controller.update_components(update_components).await
    });

    um11.expect_command("prepare").await;
    um11.push_component(component_status("um11C2", "2", ItemState::Installing));
    um11.send_state(UmState::Prepared).await;

    um12.expect_command("prepare").await;
    um12.push_component(component_status("um12C1", "2", ItemState::Installing));
    um12.push_component(component_status("um12C2", "2", ItemState::Installing));
    um12.send_state(UmState::Prepared).await;

    um11.expect_command("update").await;
    um11.send_state(UmState::Updated).await;

    // um12 fails mid-update and drops the connection without reporting.
    um12.expect_command("update").await;
    um12.disconnect().await;

    let failed_components = vec![
        component_status("um12C1", "1", ItemState::Installed),
        component_status("um12C2", "1", ItemState::Installed),
        component_status("um12C2", "2", ItemState::Error),
    ];

    let mut um12 =
        TestUm::connect("testUM12", &controller, UmState::Failed, failed_components).await;

    // The state scan resumes straight into the revert walk.
    um11.set_components(vec![
        component_status("um11C1", "1", ItemState::Installed),
        component_status("um11C2", "1", ItemState::Installed),
    ]);
    um11.expect_command("revert").await;
    um11.send_state(UmState::Idle).await;

    um12.expect_command("revert").await;
    um12.send_state(UmState::Idle).await;

    let result = update_task.await.unwrap().unwrap();
    assert!(result.error.is_none());
    assert_eq!(
        result.components,
        vec![
            component_status("um11C1", "1", ItemState::Installed),
            component_status("um11C2", "1", ItemState::Installed),
            component_status("um12C1", "1", ItemState::Installed),
            component_status("um12C2", "1", ItemState::Installed),
            component_status("um12C2", "2", ItemState::Error),
        ]
    );

    controller.close().await;
}
