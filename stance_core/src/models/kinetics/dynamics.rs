// stance_core/src/models/kinetics/dynamics.rs

use nalgebra::{DVector, Vector3, Vector6};

use super::layout::{SIZE_GYRO_BIAS, SIZE_KINE, SIZE_WRENCH};
use super::KineticsModel;
use crate::error::{EstimationResult, KinematicsResult};
use crate::kinematics::{Flags, Kinematics, Orientation};
use crate::types::{ContactId, State, GRAVITY_CONSTANT};

impl KineticsModel {
    // --- Wrenches ---

    /// Total external force and torque on the body, in the body frame.
    ///
    /// Sums the additional wrench, the unmodeled wrench when enabled, and the
    /// wrench of every contact transported from its frame to the body frame.
    pub fn local_wrench(&self, x: &State) -> (Vector3<f64>, Vector3<f64>) {
        let l = &self.layout;
        let mut force = self.additional_force;
        let mut torque = self.additional_torque;

        if self.with_unmodeled_wrench {
            force += Self::vector3(x, l.unmodeled_wrench());
            torque += Self::vector3(x, l.unmodeled_torque());
        }

        for &id in self.contacts.keys() {
            let position = Self::vector3(x, l.contact_position(id));
            let orientation = Orientation::from_rotation_vector(&Self::vector3(x, l.contact_orientation(id)));
            let contact_force = orientation.rotate(&Self::vector3(x, l.contact_force(id)));
            force += contact_force;
            torque += orientation.rotate(&Self::vector3(x, l.contact_torque(id))) + position.cross(&contact_force);
        }

        (force, torque)
    }

    /// World-frame linear and angular accelerations produced by a body-frame wrench.
    ///
    /// With `R` the body orientation, `Ω = R^T ω`, `c` the center of mass and
    /// `I` the inertia about it:
    /// - `I Ω̇ = τ - c × F - İ Ω - σ̇ - Ω × (I Ω + σ)`
    /// - `a = R (F / m - c̈ - 2 Ω × ċ - Ω × (Ω × c) - Ω̇ × c) - g e_z`
    /// - `ω̇ = R Ω̇`
    pub fn accelerations(
        &self,
        orientation: &Orientation,
        angular_velocity: &Vector3<f64>,
        force: &Vector3<f64>,
        torque: &Vector3<f64>,
    ) -> (Vector3<f64>, Vector3<f64>) {
        let inertial = &self.inertial;
        let inertia = inertial.inertia();
        let c = &inertial.center_of_mass;
        let c_dot = &inertial.center_of_mass_velocity;
        let c_ddot = &inertial.center_of_mass_acceleration;
        let sigma = &inertial.angular_momentum;

        let omega = orientation.rotate_inverse(angular_velocity);

        let omega_dot = inertial.inertia_inverse()
            * (torque
                - c.cross(force)
                - inertial.inertia_derivative * omega
                - inertial.angular_momentum_derivative
                - omega.cross(&(inertia * omega + sigma)));

        let body_acceleration = force / inertial.mass
            - c_ddot
            - 2.0 * omega.cross(c_dot)
            - omega.cross(&omega.cross(c))
            - omega_dot.cross(c);

        let linear = orientation.rotate(&body_acceleration) - Vector3::z() * GRAVITY_CONSTANT;
        let angular = orientation.rotate(&omega_dot);
        (linear, angular)
    }

    /// Accelerations of the body implied by the state `x`.
    pub fn state_accelerations(&self, x: &State) -> (Vector3<f64>, Vector3<f64>) {
        let (force, torque) = self.local_wrench(x);
        let orientation = self.orientation(x);
        let angular_velocity = Self::vector3(x, self.layout.angular_velocity());
        self.accelerations(&orientation, &angular_velocity, &force, &torque)
    }

    /// World kinematics of a contact frame: body state composed with the
    /// stored relative pose and the pushed relative velocities.
    pub fn contact_global_kinematics(&self, x: &State, id: ContactId) -> KinematicsResult<Kinematics> {
        let mut local = self.contact_relative_pose(x, id);
        if let Some(contact) = self.contacts.get(&id) {
            let (v, w) = contact.local_velocities();
            local.linear_velocity = Some(v);
            local.angular_velocity = Some(w);
        }
        self.state_kinematics(x).compose(&local)
    }

    /// Wrench predicted by the visco-elastic model of a contact, in its frame.
    pub fn contact_model_wrench(&self, x: &State, id: ContactId) -> KinematicsResult<Option<Vector6<f64>>> {
        let Some(contact) = self.contacts.get(&id) else {
            return Ok(None);
        };
        let global = self.contact_global_kinematics(x, id)?;
        contact.model.wrench(&global, &contact.rest_pose).map(Some)
    }

    // --- Transition ---

    /// `x_{k+1} = f(x_k)`: integrates the floating-base dynamics over one
    /// sampling period. Bias and wrenches are constant; contacts without a
    /// force sensor move with their pushed relative velocity.
    pub fn transition(&self, x: &State) -> EstimationResult<State> {
        let l = &self.layout;
        let dt = self.dt;
        let mut next = x.clone();

        let mut kine = self.state_kinematics(x);
        let (linear, angular) = self.state_accelerations(x);
        kine.linear_acceleration = Some(linear);
        kine.angular_acceleration = Some(angular);
        kine.integrate(dt);

        let kine_vector = kine.to_vector(Flags::POSE_AND_VELOCITIES)?;
        next.rows_mut(l.kine(), SIZE_KINE).copy_from(&kine_vector);

        for (&id, contact) in self.contacts.iter().filter(|(_, c)| !c.with_real_sensor) {
            let (v, w) = contact.local_velocities();
            let position = Self::vector3(x, l.contact_position(id)) + v * dt;
            let orientation = Orientation::from_rotation_vector(&Self::vector3(x, l.contact_orientation(id)))
                .integrate(&(w * dt));
            self.write_contact_relative_pose(&mut next, id, &position, &orientation);
        }

        Ok(next)
    }

    // --- Tangent space ---

    /// `x ⊕ dx`: additive everywhere except rotations, which are perturbed
    /// in their local frame.
    pub fn tangent_sum(&self, x: &State, dx: &DVector<f64>) -> State {
        let l = &self.layout;
        let mut out = x.clone();

        // Position, then orientation on the manifold, then velocities.
        for i in 0..3 {
            out[l.position() + i] += dx[l.position_tangent() + i];
        }
        let q = self
            .orientation(x)
            .perturb(&Self::vector3(dx, l.orientation_tangent()))
            .quaternion();
        Self::write_quaternion(&mut out, l.orientation(), &q);
        for i in 0..6 {
            out[l.linear_velocity() + i] += dx[l.linear_velocity_tangent() + i];
        }

        // Gyro bias and unmodeled wrench.
        for i in 0..SIZE_GYRO_BIAS + SIZE_WRENCH {
            out[l.gyro_bias() + i] += dx[l.gyro_bias_tangent() + i];
        }

        for id in 0..l.max_contacts() {
            let (s, t) = (l.contact(id), l.contact_tangent(id));
            for i in 0..3 {
                out[s + i] += dx[t + i];
            }
            let rotation = Orientation::from_rotation_vector(&Self::vector3(x, s + 3))
                .perturb(&Self::vector3(dx, t + 3))
                .to_rotation_vector();
            out.fixed_rows_mut::<3>(s + 3).copy_from(&rotation);
            for i in 6..12 {
                out[s + i] += dx[t + i];
            }
        }
        out
    }

    /// `x1 ⊖ x2`, the tangent vector such that `x2 ⊕ (x1 ⊖ x2) = x1`.
    pub fn tangent_difference(&self, x1: &State, x2: &State) -> DVector<f64> {
        let l = &self.layout;
        let mut d = DVector::zeros(l.tangent_size());

        for i in 0..3 {
            d[l.position_tangent() + i] = x1[l.position() + i] - x2[l.position() + i];
        }
        let rotation = self.orientation(x2).differentiate(&self.orientation(x1));
        d.fixed_rows_mut::<3>(l.orientation_tangent()).copy_from(&rotation);
        for i in 0..6 {
            d[l.linear_velocity_tangent() + i] = x1[l.linear_velocity() + i] - x2[l.linear_velocity() + i];
        }

        for i in 0..SIZE_GYRO_BIAS + SIZE_WRENCH {
            d[l.gyro_bias_tangent() + i] = x1[l.gyro_bias() + i] - x2[l.gyro_bias() + i];
        }

        for id in 0..l.max_contacts() {
            let (s, t) = (l.contact(id), l.contact_tangent(id));
            for i in 0..3 {
                d[t + i] = x1[s + i] - x2[s + i];
            }
            let r1 = Orientation::from_rotation_vector(&Self::vector3(x1, s + 3));
            let r2 = Orientation::from_rotation_vector(&Self::vector3(x2, s + 3));
            d.fixed_rows_mut::<3>(t + 3).copy_from(&r2.differentiate(&r1));
            for i in 6..12 {
                d[t + i] = x1[s + i] - x2[s + i];
            }
        }
        d
    }
}
