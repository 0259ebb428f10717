// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 2222;
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_IMAGE: &str = "linuxserver/openssh-server:latest";
pub const DEFAULT_HOST_BUFFER: usize = 1;

// The banner we present to attackers. A stock Ubuntu OpenSSH string so
// that scanners classify us as an ordinary server.
pub const SERVER_BANNER: &str = "SSH-2.0-OpenSSH_8.9p1 Ubuntu 3";

// Warm pool maintenance interval.
pub const POOL_TICK: Duration = Duration::from_millis(500);

// Grace given to a container's init before docker kills it.
pub const STOP_GRACE_SECS: i64 = 10;

// Deadline applied to individual container runtime calls made outside of
// an explicit Start/Stop deadline.
pub const RUNTIME_DEADLINE: Duration = Duration::from_secs(30);

// Backend containers take a moment to begin serving SSH after
// ContainerStart returns, so the dial is retried on a short interval.
pub const DIAL_ATTEMPTS: usize = 100;
pub const DIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

// The account the honeypot image is provisioned with; every attacker is
// bridged onto this user inside their own container.
pub const BACKEND_USER: &str = "panda";
pub const BACKEND_PASSWORD: &str = "password";
pub const BACKEND_SSH_PORT: u16 = 22;

// script(1) output inside the container, copied out once at teardown.
pub const SCRIPT_STDOUT_PATH: &str = "/tmp/l";
pub const SCRIPT_TIMING_PATH: &str = "/tmp/t";

// Environment handed to every spawned container.
pub const CONTAINER_ENV: &[&str] = &[
    "PUID=1000",
    "PGID=1000",
    "TZ=Etc/UTC",
    "SUDO_ACCESS=true",
    "PASSWORD_ACCESS=true",
    "USER_PASSWORD=password",
    "USER_NAME=panda",
];
